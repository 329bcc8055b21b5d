//! Colorized console prompt that sets skiff's own lines apart from the
//! output of the tools it drives.

use nu_ansi_term::Color;
use skiff_core::Printer;

const PROMPT: &str = ">> ";

#[derive(Debug, Default)]
pub struct Prompt;

impl Prompt {
    pub fn new() -> Self {
        Self
    }

    fn prefix(color: Color, indent: usize) -> String {
        format!("{}{}", color.paint(PROMPT), " ".repeat(indent))
    }
}

impl Printer for Prompt {
    fn line_at(&self, msg: &str, indent: usize) {
        println!("{}{}", Self::prefix(Color::Green, indent), msg);
    }

    fn error_at(&self, msg: &str, indent: usize) {
        println!("{}{}", Self::prefix(Color::Red, indent), msg);
    }
}
