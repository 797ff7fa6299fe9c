mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mapmo_client::api::HttpApi;
use mapmo_client::render::TerminalUi;
use mapmo_client::telemetry::logging;
use mapmo_client::transport::websocket::WebSocketConnector;
use mapmo_client::{ChatClient, ClientHandle, Command};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::{Cli, HELP, Input, parse_input};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let config = cli.client_config()?;
    info!(
        target: "mapmo::main",
        http = %config.endpoints.http,
        socket = %config.endpoints.socket,
        credential_mode = ?config.credential_mode,
        "starting"
    );
    let api = HttpApi::new(config.endpoints.http.clone(), config.request_timeout)
        .context("failed to build HTTP client")?;
    let (client, handle) = ChatClient::new(
        config,
        Arc::new(WebSocketConnector),
        Arc::new(api),
        Arc::new(TerminalUi::stdout()),
    );
    let runtime = client.spawn();

    if let Some(username) = cli.username.clone() {
        let password = match cli.password.clone() {
            Some(password) => password,
            None => prompt_password(&username).await?,
        };
        handle.send(Command::Login { username, password })?;
    }

    read_commands(&handle).await?;
    let _ = handle.send(Command::Shutdown);
    if let Err(err) = runtime.await {
        warn!(target: "mapmo::main", error = %err, "client task ended abnormally");
    }
    Ok(())
}

async fn read_commands(handle: &ClientHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        match input {
            Input::Client(Command::SendMessage(text)) => {
                handle.send(Command::InputChanged)?;
                handle.send(Command::SendMessage(text))?;
            }
            Input::Client(command) => handle.send(command)?,
            Input::Login(username) => {
                let password = prompt_password(&username).await?;
                handle.send(Command::Login { username, password })?;
            }
            Input::Register(username) => {
                let password = prompt_password(&username).await?;
                let confirm_password = prompt("repeat password: ".to_string()).await?;
                handle.send(Command::Register {
                    username,
                    password,
                    confirm_password,
                })?;
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Empty => {}
        }
    }
    Ok(())
}

async fn prompt_password(username: &str) -> Result<String> {
    prompt(format!("password for {username}: ")).await
}

async fn prompt(prompt: String) -> Result<String> {
    tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
        .await
        .context("password prompt task failed")?
        .context("failed to read password")
}
