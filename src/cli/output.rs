use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_help() {
    println!(
        "\n{}\n",
        style("agentflow: bounded tool-calling agents on triggers")
            .bold()
            .cyan()
    );
    let commands: &[(&str, &str)] = &[
        ("serve", "Start the HTTP API, cron triggers and workers"),
        ("worker", "Run queue workers only"),
        ("scheduler", "Run cron triggers and workers without the API"),
        ("run --agent <id> --prompt <text>", "Run one agent synchronously"),
        ("validate <file>", "Check an agent definition file"),
        ("help", "Show this message"),
    ];
    for (cmd, about) in commands {
        println!("  {:<36} {}", style(cmd).green(), about);
    }
    println!(
        "\n {} {} [--config <file>] <command>\n",
        style("Usage:").bold(),
        style("agentflow").green()
    );
}
