use console::style;

#[tokio::main]
async fn main() {
    if let Err(e) = agentflow::cli::run_main().await {
        eprintln!("{} {:#}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}
