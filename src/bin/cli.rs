//! CLI wrapper around the outward HTTP API: add/remove/list/get-stream
//! subcommands that talk to a running `dash2hls-server` over HTTP.

use std::collections::HashMap;

use clap::{Parser, Subcommand};
use dash2hls::config::{StreamInfo, StreamStatus};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "dash2hls-cli", about = "Control a dash2hls-server instance")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a new stream to convert.
    AddStream {
        #[arg(long)]
        mpd_url: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        kid: Option<String>,
        /// Provide multiple keys as KID:KEY (hex). Repeat for multiple entries.
        #[arg(long = "key-map")]
        key_map: Vec<String>,
        #[arg(long)]
        representation_id: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        poll_interval: Option<f64>,
        #[arg(long)]
        window_size: Option<usize>,
        #[arg(long)]
        history_size: Option<usize>,
        #[arg(long)]
        mp4decrypt_path: Option<String>,
        /// Additional HTTP header as Name:Value. Repeat for multiple entries.
        #[arg(long)]
        header: Vec<String>,
        #[arg(long)]
        output_dir: Option<String>,
        #[arg(long, default_value = "http://localhost:8000")]
        server: String,
    },
    /// Remove a stream.
    RemoveStream {
        #[arg(long)]
        stream_id: String,
        #[arg(long, default_value = "http://localhost:8000")]
        server: String,
    },
    /// List all active streams.
    ListStreams {
        #[arg(long, default_value = "http://localhost:8000")]
        server: String,
    },
    /// Get information about a specific stream.
    GetStream {
        #[arg(long)]
        stream_id: String,
        #[arg(long, default_value = "http://localhost:8000")]
        server: String,
    },
}

fn split_pair(entry: &str, what: &str) -> anyhow::Result<(String, String)> {
    let (left, right) = entry
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("{what} must be in the form KEY:VALUE, got {entry:?}"))?;
    Ok((left.trim().to_string(), right.trim().to_string()))
}

#[derive(Debug, Serialize)]
struct AddStreamPayload {
    mpd_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_map: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    representation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    poll_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    history_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mp4decrypt_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<HashMap<String, String>>,
}

async fn add_stream(
    server: &str,
    mpd_url: String,
    key: Option<String>,
    kid: Option<String>,
    key_map: Vec<String>,
    representation_id: Option<String>,
    label: Option<String>,
    poll_interval: Option<f64>,
    window_size: Option<usize>,
    history_size: Option<usize>,
    mp4decrypt_path: Option<String>,
    header: Vec<String>,
    output_dir: Option<String>,
) -> anyhow::Result<()> {
    let key_map = if key_map.is_empty() {
        None
    } else {
        let mut map = HashMap::new();
        for entry in &key_map {
            let (kid, key) = split_pair(entry, "--key-map entries")?;
            map.insert(kid, key);
        }
        Some(map)
    };

    let headers = if header.is_empty() {
        None
    } else {
        let mut map = HashMap::new();
        for entry in &header {
            let (name, value) = split_pair(entry, "headers")?;
            map.insert(name, value);
        }
        Some(map)
    };

    let payload = AddStreamPayload {
        mpd_url,
        key,
        kid,
        key_map,
        representation_id,
        label,
        poll_interval,
        window_size,
        history_size,
        mp4decrypt_path,
        output_dir,
        headers,
    };

    let client = reqwest::Client::new();
    let response = client.post(format!("{server}/streams")).json(&payload).send().await?;
    let response = response.error_for_status()?;
    let body: Value = response.json().await?;

    println!("Stream added successfully!");
    println!("Stream ID: {}", body["stream_id"].as_str().unwrap_or("?"));
    println!("HLS URL: {server}{}", body["hls_url"].as_str().unwrap_or(""));
    println!("Status: {}", body["status"].as_str().unwrap_or("?"));
    Ok(())
}

async fn remove_stream(server: &str, stream_id: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    client.delete(format!("{server}/streams/{stream_id}")).send().await?.error_for_status()?;
    println!("Stream {stream_id} removed successfully!");
    Ok(())
}

fn print_status_line(label: &str, status: StreamStatus) {
    let status = match status {
        StreamStatus::Initializing => "initializing",
        StreamStatus::Starting => "starting",
        StreamStatus::Running => "running",
        StreamStatus::Completed => "completed",
        StreamStatus::Stopped => "stopped",
        StreamStatus::Error => "error",
    };
    println!("{label}{status}");
}

fn print_stream(stream: &StreamInfo, server: &str, indent: &str) {
    println!("{indent}Stream ID: {}", stream.stream_id);
    println!("{indent}MPD URL: {}", stream.mpd_url);
    print_status_line(&format!("{indent}Status: "), stream.status);
    println!("{indent}HLS URL: {server}{}", stream.hls_url);
    println!("{indent}Live: {}", stream.is_live);
    if let Some(id) = &stream.representation_id {
        println!("{indent}Representation: {id}");
    }
    if let Some(bw) = stream.bandwidth {
        println!("{indent}Bandwidth: {bw} bps");
    }
    if let Some(codecs) = &stream.codecs {
        println!("{indent}Codecs: {codecs}");
    }
    if let Some((w, h)) = stream.resolution {
        println!("{indent}Resolution: {w}x{h}");
    }
    if let Some(label) = &stream.label {
        println!("{indent}Label: {label}");
    }
    if let Some(seq) = stream.last_sequence {
        println!("{indent}Last Sequence: {seq}");
    }
    if let Some(error) = &stream.error {
        println!("{indent}Error: {error}");
    }
}

async fn list_streams(server: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = client.get(format!("{server}/streams")).send().await?.error_for_status()?;
    #[derive(serde::Deserialize)]
    struct StreamsResponse {
        streams: Vec<StreamInfo>,
    }
    let body: StreamsResponse = response.json().await?;

    if body.streams.is_empty() {
        println!("No active streams");
        return Ok(());
    }

    println!("Found {} stream(s):", body.streams.len());
    println!();
    for stream in &body.streams {
        print_stream(stream, server, "");
        println!();
    }
    Ok(())
}

async fn get_stream(server: &str, stream_id: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = client.get(format!("{server}/streams/{stream_id}")).send().await?.error_for_status()?;
    let stream: StreamInfo = response.json().await?;
    print_stream(&stream, server, "");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::AddStream {
            mpd_url,
            key,
            kid,
            key_map,
            representation_id,
            label,
            poll_interval,
            window_size,
            history_size,
            mp4decrypt_path,
            header,
            output_dir,
            server,
        } => {
            add_stream(
                &server,
                mpd_url,
                key,
                kid,
                key_map,
                representation_id,
                label,
                poll_interval,
                window_size,
                history_size,
                mp4decrypt_path,
                header,
                output_dir,
            )
            .await
        }
        Command::RemoveStream { stream_id, server } => remove_stream(&server, &stream_id).await,
        Command::ListStreams { server } => list_streams(&server).await,
        Command::GetStream { stream_id, server } => get_stream(&server, &stream_id).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
