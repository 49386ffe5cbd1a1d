use anyhow::{Context, Result};
use ditto_actors::{StreamingType, SubscriberFilter};
use ditto_enforcement::{DittoConfig, DittoNode, Reply};
use ditto_model::Signal;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Lines queued for stdout before producers wait
const OUTPUT_BUFFER: usize = 256;

pub fn load_config(path: Option<&Path>) -> Result<DittoConfig> {
    match path {
        Some(path) => DittoConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(DittoConfig::default()),
    }
}

pub fn check_config(config: &DittoConfig) -> Result<()> {
    print!("{}", config.to_yaml()?);
    Ok(())
}

/// Serve signals from stdin until EOF, then wait for outstanding requests
/// and shut the node down
pub async fn run(config: DittoConfig, subjects: Vec<String>) -> Result<()> {
    let node = Arc::new(DittoNode::new(config));
    let (out, mut lines_out) = mpsc::channel::<Value>(OUTPUT_BUFFER);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines_out.recv().await {
            let mut text = line.to_string();
            text.push('\n');
            stdout.write_all(text.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut subscriptions = JoinSet::new();
    if !subjects.is_empty() {
        for streaming_type in [StreamingType::LiveCommands, StreamingType::Messages] {
            let filter = SubscriberFilter::for_subjects(subjects.iter().map(String::as_str));
            let (_, mut publications) = node.subscribe(streaming_type, filter, 64);
            let out = out.clone();
            subscriptions.spawn(async move {
                while let Some(publication) = publications.recv().await {
                    let line = match serde_json::to_value(&publication.signal) {
                        Ok(signal) => json!({ "publication": signal }),
                        Err(err) => error_line("internalerror", &err.to_string()),
                    };
                    if out.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        info!(?subjects, "printing live publications");
    }

    let mut requests = JoinSet::new();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = input.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let signal: Signal = match serde_json::from_str(line) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "unparsable signal");
                out.send(error_line("json.invalid", &err.to_string())).await?;
                continue;
            }
        };
        debug!(signal = signal.name(), correlation_id = ?signal.correlation_id(), "signal read");
        // delivered in input order; replies are forwarded as they come
        let mut replies = node.submit(signal).await;
        let out = out.clone();
        requests.spawn(async move {
            while let Some(reply) = replies.recv().await {
                if out.send(reply_line(reply)).await.is_err() {
                    break;
                }
            }
        });
    }

    while let Some(result) = requests.join_next().await {
        if let Err(err) = result {
            warn!(error = %err, "request task failed");
        }
    }
    subscriptions.abort_all();
    node.shutdown().await;
    drop(out);
    writer.await??;
    Ok(())
}

fn reply_line(reply: Reply) -> Value {
    match reply {
        Ok(signal) => serde_json::to_value(&signal)
            .unwrap_or_else(|err| error_line("internalerror", &err.to_string())),
        Err(err) => {
            let mut body = err.to_json();
            let headers = serde_json::to_value(err.headers());
            if let (Some(fields), Ok(headers)) = (body.as_object_mut(), headers) {
                fields.insert("headers".to_string(), headers);
            }
            body
        }
    }
}

fn error_line(code: &str, message: &str) -> Value {
    let status = if code == "json.invalid" { 400 } else { 500 };
    json!({ "status": status, "error": code, "message": message })
}
