//! Minimal stdout/stderr formatting shared by every command.

use serde::Serialize;

pub fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(error) => print_error(&format!("failed to format output: {error}")),
    }
}

pub fn print_error(msg: &str) {
    eprintln!("error: {msg}");
}

pub fn print_success(msg: &str) {
    println!("✓ {msg}");
}

pub fn print_info(msg: &str) {
    println!("{msg}");
}
