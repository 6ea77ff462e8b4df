use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

mod commands;
mod config;
mod logging;

use config::AppConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn cli() -> Command {
    Command::new("tokenrelay")
        .version(VERSION)
        .about("tokenrelay - streaming chat with reconnect-safe message delivery")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the chat server with the echo provider and in-memory store")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("HOST")
                        .help("Host address to bind to"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .help("Port to bind the server to")
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("token-delay-ms")
                        .long("token-delay-ms")
                        .value_name("MS")
                        .help("Pause between echoed tokens")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("chat")
                .about("Send one message and stream the reply")
                .arg(
                    Arg::new("url")
                        .short('u')
                        .long("url")
                        .value_name("WS_URL")
                        .help("WebSocket endpoint, e.g. ws://127.0.0.1:8080/ws/chat"),
                )
                .arg(
                    Arg::new("model")
                        .short('m')
                        .long("model")
                        .value_name("MODEL")
                        .default_value("echo"),
                )
                .arg(
                    Arg::new("conversation")
                        .long("conversation")
                        .value_name("ID")
                        .help("Continue an existing conversation"),
                )
                .arg(
                    Arg::new("image")
                        .long("image")
                        .value_name("DATA_URL")
                        .help("Attach an image (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("vision-model")
                        .long("vision-model")
                        .value_name("MODEL")
                        .help("Model used for attached images"),
                )
                .arg(Arg::new("message").required(true).value_name("MESSAGE")),
        )
        .subcommand(
            Command::new("id")
                .about("Generate message ids or inspect one")
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .value_name("N")
                        .default_value("1")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("inspect")
                        .long("inspect")
                        .value_name("ID")
                        .help("Validate an id and print its embedded timestamp"),
                ),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<PathBuf>("config");
    let config = match AppConfig::load(config_path.map(PathBuf::as_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\x1b[31m\u{2717}\x1b[0m {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = logging::init_tracing(&config.logging) {
        eprintln!("\x1b[31m\u{2717}\x1b[0m {:#}", e);
        std::process::exit(2);
    }

    let result = match matches.subcommand() {
        Some(("serve", sub_matches)) => commands::serve::run(sub_matches, config).await,
        Some(("chat", sub_matches)) => commands::chat::run(sub_matches, config).await,
        Some(("id", sub_matches)) => commands::id::run(sub_matches),
        _ => {
            println!("tokenrelay v{}", VERSION);
            println!("Use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("\x1b[31m\u{2717}\x1b[0m {:#}", e);
        std::process::exit(1);
    }
}
