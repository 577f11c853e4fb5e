//! Non-interactive commands: one question, the model list, the GPU check.

use std::io::Write;
use std::ops::ControlFlow;

use anyhow::{bail, Context, Result};
use tracing::warn;

use localchat_core::engine::DeltaStream;
use localchat_core::renderer::{self, RenderFailure};
use localchat_core::{
    capability, ChatMessage, Config, EngineHandle, GenerationStats, InferenceEngine, Model,
    OllamaEngine, ProgressEvent,
};

use crate::Commands;

pub async fn run(command: Commands, config: &Config, model: Model) -> Result<()> {
    match command {
        Commands::Ask { question } => ask(config, model, &question).await,
        Commands::Models => list_models(config, model).await,
        Commands::Probe => probe().await,
    }
}

async fn probe() -> Result<()> {
    let report = capability::probe(capability::default_host().as_ref()).await;
    if !report.supported {
        bail!("GPU not available: {}", report.reason);
    }
    println!("{}", report.summary());
    Ok(())
}

async fn list_models(config: &Config, selected: Model) -> Result<()> {
    let engine = OllamaEngine::new(&config.ollama_url);
    let local = match engine.list_local_models().await {
        Ok(models) => Some(models),
        Err(e) => {
            warn!(error = %e, "could not list downloaded models");
            None
        }
    };

    println!("\nAvailable models");
    println!("{}", "=".repeat(40));
    for model in Model::all() {
        let marker = if model == selected { "*" } else { " " };
        let status = match &local {
            Some(names) if names.iter().any(|n| n == model.as_str()) => "downloaded",
            Some(_) => "",
            None => "?",
        };
        println!(
            "{} {:<14} {:<14} {}",
            marker,
            model.display_name(),
            model.as_str(),
            status
        );
    }
    if local.is_none() {
        println!("\nCould not reach Ollama at {}", engine.base_url());
        println!("Make sure Ollama is running: ollama serve");
    }
    Ok(())
}

async fn ask(config: &Config, model: Model, question: &str) -> Result<()> {
    if question.trim().is_empty() {
        bail!("question is empty");
    }

    let report = capability::probe(capability::default_host().as_ref()).await;
    if !report.supported {
        bail!("GPU not available: {}", report.reason);
    }

    let engine = OllamaEngine::new(&config.ollama_url);
    let mut last_label = String::new();
    let handle = engine
        .load(model.as_str(), &mut |progress: ProgressEvent| {
            if progress.label != last_label {
                eprintln!("{} ({}%)", progress.label, progress.percent());
                last_label = progress.label;
            }
        })
        .await?;

    let history = [ChatMessage::user(question.trim())];
    let deltas = handle.stream_chat(&history, &config.chat_params()).await?;

    let stats = stream_reply(deltas, &mut std::io::stdout()).await?;
    eprintln!("{}", stats);
    Ok(())
}

/// Write deltas to `out` as they arrive. A failed write ends the stream.
async fn stream_reply(deltas: DeltaStream, out: &mut impl Write) -> Result<GenerationStats> {
    let mut write_error = None;
    let outcome = renderer::render(deltas, |r| {
        match write!(out, "{}", r.last_delta()).and_then(|()| out.flush()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                write_error = Some(e);
                ControlFlow::Break(())
            }
        }
    })
    .await;

    if let Some(e) = write_error {
        return Err(e).context("could not write the reply");
    }
    writeln!(out).context("could not write the reply")?;

    match outcome {
        Ok(output) => Ok(output.stats),
        Err(RenderFailure { error, partial }) => {
            warn!(received = partial.len(), "reply cut short");
            Err(error.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::io;

    fn deltas(chunks: &[&str]) -> DeltaStream {
        let items: Vec<_> = chunks.iter().map(|c| Ok(c.to_string())).collect();
        Box::pin(stream::iter(items))
    }

    /// Accepts `room` bytes, then fails like a closed pipe.
    struct ClosedPipe {
        written: Vec<u8>,
        room: usize,
    }

    impl Write for ClosedPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_reply_writes_deltas_and_newline() {
        let mut out = Vec::new();
        let stats = stream_reply(deltas(&["Hi", " there", "!"]), &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hi there!\n");
        assert_eq!(stats.token_count, 3);
    }

    #[tokio::test]
    async fn test_stream_reply_stops_on_write_error() {
        let mut out = ClosedPipe {
            written: Vec::new(),
            room: 3,
        };
        let err = stream_reply(deltas(&["one", " two", " three"]), &mut out)
            .await
            .unwrap_err();

        assert_eq!(out.written, b"one");
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_stream_reply_surfaces_engine_failure() {
        let items = vec![
            Ok("Partial".to_string()),
            Err(localchat_core::GenerationError::Engine("out of memory".to_string())),
        ];
        let mut out = Vec::new();
        let err = stream_reply(Box::pin(stream::iter(items)), &mut out).await.unwrap_err();

        assert_eq!(err.to_string(), "out of memory");
        assert_eq!(String::from_utf8(out).unwrap(), "Partial\n");
    }
}
