use clap::{App, Arg};
use journalkeeper_core::error::KeeperError;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let matches = App::new("JournalKeeper")
        .version("0.1.0")
        .about("Replicated state machine framework on the raft protocol.")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .required(true)
                .default_value("Config.toml")
                .help("Location of the config file."),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();

    let shutdown = tokio::sync::broadcast::channel(1);
    let shutdown_tx = shutdown.0.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    if let Err(err) = journalkeeper::journalkeeper(config_path, shutdown).await {
        eprintln!("journalkeeper: {}", err);
        let code = match err {
            KeeperError::StorageFault(_) => 2,
            KeeperError::ConfigError(_) => 3,
            _ => 1,
        };
        std::process::exit(code);
    }
}
