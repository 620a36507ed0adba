//! plexus: one-shot operator client.
//!
//! `plexus [ADDR] COMMAND [ARGS...]` connects to a daemon (default
//! `localhost:10001`), sends one command and prints the reply when the
//! command has one. With no arguments it sends `echo hello`. For `model`
//! and `set_topology` the argument is a file whose contents are sent.

use {
    clap::{crate_version, App, Arg},
    plexus_comm::{client, commands, config::CommConfig},
    std::process::exit,
};

const DEFAULT_ADDR: &str = "localhost:10001";
const REPLY_TIMEOUT_MS: u64 = 10_000;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let matches = App::new("plexus")
        .about("send one command to a plexus daemon")
        .version(crate_version!())
        .arg(
            Arg::with_name("args")
                .value_name("[ADDR] COMMAND [ARGS...]")
                .multiple(true)
                .help("Optional daemon address, then a command and its arguments"),
        )
        .get_matches();

    let args: Vec<String> = matches
        .values_of("args")
        .map(|v| v.map(str::to_string).collect())
        .unwrap_or_default();

    // The address is optional; anything that is not a known command is
    // taken as the address.
    let mut rest = args.as_slice();
    let addr = match rest.first() {
        Some(first) if commands::command_id(first).is_err() => {
            let addr = first.clone();
            rest = &rest[1..];
            addr
        }
        _ => DEFAULT_ADDR.to_string(),
    };
    let (command, params) = match rest.first() {
        Some(command) => (command.clone(), rest[1..].join(" ")),
        None => ("echo".to_string(), "hello".to_string()),
    };

    if let Err(e) = run(&addr, &command, &params) {
        eprintln!("plexus: {e}");
        exit(1);
    }
}

fn run(addr: &str, command: &str, params: &str) -> plexus_comm::Result<()> {
    // Commands carrying a description send a file's contents.
    let payload = if matches!(command, "model" | "set_topology") && !params.is_empty() {
        std::fs::read_to_string(params)?
    } else {
        params.to_string()
    };

    let config = CommConfig::default();
    let mut client =
        client::Client::connect(addr, config.listen_port, config.max_frame_size)?;
    client.send(command, payload.as_bytes())?;
    if client::has_reply(command) {
        println!("{}", client.read_reply(REPLY_TIMEOUT_MS)?);
    }
    Ok(())
}
