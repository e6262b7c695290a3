use anyhow::Result;
use clap::Parser;
use ssh_fleet::{cli::Cli, config::Config, run_fleet, telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let config = Config::from_cli(&cli)?;
    println!("SSH Fleet v{}", env!("CARGO_PKG_VERSION"));
    println!("Targets: {} host(s)", config.hosts.len());

    let report = run_fleet(config);

    for outcome in &report.outcomes {
        let mark = if outcome.success { "✅" } else { "❌" };
        println!("{} [{}] {}", mark, outcome.host, outcome.message);
    }

    if let Err(e) = report.into_result() {
        eprintln!("\n❌ {}\n", e);
        std::process::exit(1);
    }

    println!("\n✅ All hosts succeeded!\n");
    Ok(())
}
