//! Terminal front end for the `client` subcommand.

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    select,
};
use tracing::warn;

use crate::{
    client::{ChatClient, ClientEvent, EventStream},
    config::ClientConfig,
    error::ClientError,
};

const NOT_CONNECTED_NOTICE: &str =
    "!!! not connected to the broker; start it with `chat-relay broker`";

pub async fn run(config: ClientConfig) -> Result<()> {
    let (client, events) = ChatClient::start(config)?;
    chat(client, events, BufReader::new(tokio::io::stdin()).lines()).await
}

/// `next_line` keeps a partially read line when another branch wins the race.
async fn chat<R>(client: ChatClient, mut events: EventStream, mut input: Lines<R>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            event = events.recv() => {
                match event {
                    Some(event) => render_event(event).await?,
                    None => break,
                }
            }
            line = input.next_line() => {
                if !handle_stdin_input(line, &client).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}

async fn handle_stdin_input(line: io::Result<Option<String>>, client: &ChatClient) -> Result<bool> {
    let Some(input) = line? else {
        return Ok(false);
    };

    if input.trim().eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    // The line is consumed whatever happens; failed sends are not retried.
    match client.send(&input).await {
        Ok(_) => {}
        Err(ClientError::NotConnected) => write_stderr(NOT_CONNECTED_NOTICE).await?,
        Err(err) => write_stderr(&format!("!!! {err}")).await?,
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::Status(status) => write_stdout(&format!("*** status: {status}")).await,
        ClientEvent::Message(message) => {
            write_stdout(&format!("[{}] {}", message.time_label(), message.content)).await
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
