use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use replbox_core::config::{ConfigLoader, ReplboxConfig};
use replbox_core::protocol::OUTPUT;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

mod repl;

const DEFAULT_CONFIG: &str = "replbox.yaml";

#[derive(Parser, Debug)]
#[clap(name = "replbox", author, version, about = "Run untrusted REPL code in isolated contexts")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        help = "Configuration file (defaults to ./replbox.yaml, then the built-in languages)"
    )]
    config: Option<String>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an interactive REPL
    Run {
        language: String,

        #[clap(long, help = "Use the in-process frame backend even if workers are available")]
        no_thread: bool,
    },
    /// Evaluate one fragment and print its result
    Eval {
        language: String,
        code: String,

        #[clap(long, help = "Use the in-process frame backend even if workers are available")]
        no_thread: bool,
    },
    /// List the configured languages
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);

    match cli.command {
        Commands::Run { .. } => {
            // Keep the terminal for the REPL itself
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open("replbox.log")
                .context("Failed to create replbox.log")?;
            env_logger::Builder::new()
                .filter_level(log_level_filter)
                .target(env_logger::Target::Pipe(Box::new(log_file)))
                .init();
        }
        _ => {
            env_logger::Builder::new()
                .filter_level(log_level_filter)
                .target(env_logger::Target::Stderr)
                .init();
        }
    }

    expose_sibling_binaries();
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Languages => {
            for language in &config.languages {
                println!("{:<12} {} (.{})", language.system_name, language.name, language.extension);
            }
            Ok(())
        }
        Commands::Eval {
            language,
            code,
            no_thread,
        } => eval_once(&config, &language, &code, !no_thread).await,
        Commands::Run { language, no_thread } => {
            repl::Repl::start(&config, &language, !no_thread)
                .await?
                .run()
                .await
        }
    }
}

async fn load_config(path: Option<&str>) -> Result<ReplboxConfig> {
    let config = match path {
        Some(path) => ConfigLoader::from_file(path).await?,
        None if Path::new(DEFAULT_CONFIG).exists() => ConfigLoader::from_file(DEFAULT_CONFIG).await?,
        None => ConfigLoader::defaults()?,
    };
    log::info!("Configured languages: {}", config.languages.len());
    Ok(config)
}

async fn eval_once(config: &ReplboxConfig, language: &str, code: &str, prefer_thread: bool) -> Result<()> {
    let session = config
        .session_builder()?
        .input_provider(Arc::new(repl::StdinInput::new()))
        .build()?;
    session.on(&[OUTPUT], |data, _| {
        print!("{}", repl::display_text(data));
        let _ = std::io::stdout().flush();
    });

    session
        .load(language, prefer_thread && config.session.prefer_thread)
        .await
        .with_context(|| format!("Failed to load language '{}'", language))?;

    let outcome = session.run(code).await?;
    session.kill();
    match outcome {
        Ok(value) => {
            if !value.is_null() {
                println!("{}", repl::display_text(&value));
            }
            Ok(())
        }
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Let bare worker entry points such as `replbox-guest` resolve next to
/// this executable before the rest of `PATH`.
fn expose_sibling_binaries() {
    let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    else {
        return;
    };
    let mut paths = vec![dir];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    match std::env::join_paths(paths) {
        Ok(joined) => std::env::set_var("PATH", joined),
        Err(e) => log::warn!("Could not extend PATH with the replbox directory: {}", e),
    }
}
