//! Terminal output helpers

use std::fmt::Display;
use std::time::Duration;

use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

const FIELD_WIDTH: usize = 20;

fn status(mark: ColoredString, message: &str) {
    println!("{} {}", mark, message);
}

pub fn success(message: &str) {
    status("✓".green().bold(), message);
}

/// Errors go to stderr.
pub fn error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn info(message: &str) {
    status("ℹ".blue().bold(), message);
}

pub fn warning(message: &str) {
    status("⚠".yellow().bold(), message);
}

pub fn header(text: &str) {
    println!("\n{}", text.bold().underline());
}

/// A right-aligned label and its value.
pub fn field(label: &str, value: impl Display) {
    println!("  {:>width$}  {}", label.cyan(), value, width = FIELD_WIDTH);
}

/// `1234567` as `1,234,567 sat`.
pub fn sats(amount: u64) -> String {
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{} sat", grouped)
}

/// Spinner shown while waiting on the network. Call `finish_and_clear` when done.
pub fn waiting(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

pub fn qr_code(data: &str) -> anyhow::Result<()> {
    let code = qrcode::QrCode::new(data.as_bytes())?;
    let rendered = code
        .render::<char>()
        .quiet_zone(false)
        .module_dimensions(2, 1)
        .build();
    println!("\n{}\n", rendered);
    Ok(())
}

pub fn separator() {
    println!("{}", "─".repeat(FIELD_WIDTH * 3).dimmed());
}

pub fn json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
