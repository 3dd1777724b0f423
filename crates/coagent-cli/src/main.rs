//! The coagent CLI: publish one message to a named agent and print the
//! reply or the reply stream.
//!
//! Connects either straight to a NATS broker (`nats://…`) or through an
//! HTTP bridge (`http://…` / `https://…`).

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use coagent::{Address, Channel, MessageHeader, NatsChannel, PublishOptions, RawMessage};

mod http;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "coagent", about = "Talk to an agent on a coagent broker")]
struct Cli {
    /// The type of the agent to communicate with.
    agent: String,

    /// The message body (JSON).
    #[arg(short = 'd', long)]
    data: Option<String>,

    /// Message headers as `key:value`; at least `type:<Name>` is required.
    #[arg(short = 'H', long = "header", required = true)]
    headers: Vec<String>,

    /// Consume a streaming reply instead of a single one.
    #[arg(long)]
    stream: bool,

    /// Broker URL (`nats://…`) or HTTP bridge URL (`http(s)://…`).
    #[arg(long, default_value = "nats://localhost:4222")]
    server: String,

    /// Bearer token for the HTTP bridge.
    #[arg(long, default_value = "")]
    auth: String,

    /// Log level filter.
    #[arg(long, default_value = "error")]
    level: String,
}

fn make_msg(headers: &[String], data: Option<&str>) -> anyhow::Result<RawMessage> {
    let mut r#type = None;
    let mut content_type = None;
    for header in headers {
        let Some((key, value)) = header.split_once(':') else {
            bail!("malformed header '{header}', expected key:value");
        };
        match key.trim() {
            "type" => r#type = Some(value.trim().to_string()),
            "content_type" => content_type = Some(value.trim().to_string()),
            other => bail!("unsupported header key '{other}'"),
        }
    }
    let Some(r#type) = r#type else {
        bail!("a 'type:<Name>' header is required");
    };

    let mut header = MessageHeader::new(r#type);
    if let Some(content_type) = content_type {
        header.content_type = content_type;
    }
    let content = data.map(|d| d.as_bytes().to_vec()).unwrap_or_default();
    Ok(RawMessage::new(header, content))
}

fn print_msg(raw: &RawMessage) {
    match raw.encode_json() {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("unprintable message: {err}"),
    }
}

async fn run_nats(cli: &Cli, addr: Address, msg: RawMessage) -> anyhow::Result<()> {
    let channel = NatsChannel::new(cli.server.clone());
    channel
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;

    if cli.stream {
        let mut stream = channel.publish_multi(addr, msg, true).await?;
        while let Some(item) = stream.next().await {
            print_msg(&item?);
        }
    } else {
        let reply = channel
            .publish(
                addr,
                msg,
                PublishOptions::request().timeout(REQUEST_TIMEOUT),
            )
            .await?
            .context("request returned no reply")?;
        print_msg(&reply);
    }

    channel.close().await?;
    Ok(())
}

async fn run_http(cli: &Cli, addr: Address, msg: RawMessage) -> anyhow::Result<()> {
    let client = http::BridgeClient::new(cli.server.clone(), cli.auth.clone());
    if cli.stream {
        client
            .publish_multi(&addr, &msg, |raw| print_msg(&raw))
            .await
    } else {
        let reply = client
            .publish(&addr, &msg, REQUEST_TIMEOUT.as_secs_f64())
            .await?;
        print_msg(&reply);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.level))
        .with_writer(std::io::stderr)
        .init();

    let msg = make_msg(&cli.headers, cli.data.as_deref())?;
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let addr = Address::new(cli.agent.clone(), session_id);

    if cli.server.starts_with("nats://") {
        run_nats(&cli, addr, msg).await
    } else if cli.server.starts_with("http://") || cli.server.starts_with("https://") {
        run_http(&cli, addr, msg).await
    } else {
        bail!("unsupported server '{}'", cli.server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_message_from_headers_and_body() {
        let msg = make_msg(
            &["type:Ping".to_string()],
            Some(r#"{"text":"hello"}"#),
        )
        .unwrap();
        assert_eq!(msg.header.r#type, "Ping");
        assert_eq!(msg.header.content_type, "application/json");
        assert_eq!(msg.content, br#"{"text":"hello"}"#);
    }

    #[test]
    fn requires_a_type_header() {
        assert!(make_msg(&["content_type:application/json".to_string()], None).is_err());
        assert!(make_msg(&["nonsense".to_string()], None).is_err());
    }
}
