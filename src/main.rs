#![warn(clippy::all, rust_2018_idioms)]

//! Process entry point.
//!
//! The interactive command-line shell (argument parsing, subcommand
//! dispatch, colored rendering) is an external collaborator and lives
//! outside this crate; `main` only wires up logging and process-wide
//! singletons and then would hand off to that shell.

fn init_logging() {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "", "awsideman") {
        let log_dir = proj_dirs.data_dir().join("logs");
        let _ = std::fs::create_dir_all(&log_dir);

        let log_path = log_dir.join("awsideman.log");
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
            .expect("Failed to open log file");

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .parse(
                        std::env::var("AWSIDEMAN_LOG")
                            .unwrap_or_else(|_| "awsideman=info,aws_config=warn".to_string()),
                    )
                    .expect("Failed to parse env filter"),
            )
            .with_writer(move || file.try_clone().expect("Failed to clone log file handle"))
            .with_ansi(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");

        tracing::info!("awsideman core initialized, logging to {:?}", log_path);
    }
}

fn main() {
    init_logging();
    eprintln!(
        "awsideman core {} ({}@{}) -- invoke through the CLI shell",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_BRANCH"),
        env!("GIT_COMMIT"),
    );
}
