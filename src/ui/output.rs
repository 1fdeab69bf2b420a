use crate::ui::{palette, Icons};
use owo_colors::OwoColorize;

pub fn header(text: &str) {
    println!("{} {}", Icons::ROCKET, text.style(palette().title));
}

pub fn status(icon: &str, label: &str, value: &str) {
    println!("{} {}: {}", icon, label.style(palette().label), value);
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(palette().ok));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(palette().failure));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(palette().caution));
}

pub fn info(label: &str, value: &str) {
    println!(
        "{} {}: {}",
        Icons::INFO.style(palette().accent),
        label.style(palette().label),
        value
    );
}

pub fn section(title: &str) {
    println!();
    println!("━{}━", title.style(palette().title));
}

pub fn layer(index: usize, collections: &[String]) {
    println!(
        "  {} {}",
        format!("layer {}", index).style(palette().accent),
        collections.join(", ")
    );
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(palette().label), value);
}
