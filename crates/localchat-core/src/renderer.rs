//! Streaming renderer: accumulates deltas and re-formats the whole buffer on
//! every step, since markup spans can straddle chunk boundaries.

use std::fmt;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tracing::debug;

use crate::error::GenerationError;
use crate::markup::{self, Line};

/// Below this, a throughput figure is noise.
const MIN_MEASURABLE: Duration = Duration::from_millis(1);

/// Throughput of one finished generation. Token count is the number of
/// deltas received, an approximation of real tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats {
    pub token_count: usize,
    pub elapsed: Duration,
    tokens_per_second: Option<f64>,
}

impl GenerationStats {
    pub fn new(token_count: usize, elapsed: Duration) -> Self {
        let tokens_per_second = if elapsed < MIN_MEASURABLE {
            None
        } else {
            let rate = token_count as f64 / elapsed.as_secs_f64();
            rate.is_finite().then_some(rate)
        };
        Self {
            token_count,
            elapsed,
            tokens_per_second,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// `None` when the stream was too short to measure.
    pub fn tokens_per_second(&self) -> Option<f64> {
        self.tokens_per_second
    }
}

impl fmt::Display for GenerationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Last response: {} tokens in {:.1}s",
            self.token_count,
            self.elapsed_seconds()
        )?;
        match self.tokens_per_second {
            Some(rate) => write!(f, " ({rate:.1} tok/s)"),
            None => write!(f, " (tok/s unavailable)"),
        }
    }
}

/// Push-based accumulator for one streamed response.
#[derive(Debug, Clone)]
pub struct StreamRenderer {
    text: String,
    lines: Vec<Line>,
    last_delta: String,
    token_count: usize,
    started: Instant,
    last_chunk: Option<Instant>,
}

impl Default for StreamRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRenderer {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            lines: markup::format(""),
            last_delta: String::new(),
            token_count: 0,
            started: Instant::now(),
            last_chunk: None,
        }
    }

    pub fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
        self.lines = markup::format(&self.text);
        self.last_delta.clear();
        self.last_delta.push_str(delta);
        self.token_count += 1;
        self.last_chunk = Some(Instant::now());
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn last_delta(&self) -> &str {
        &self.last_delta
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Stats measured from start to the last delta (or now, if none arrived).
    pub fn stats(&self) -> GenerationStats {
        let end = self.last_chunk.unwrap_or_else(Instant::now);
        GenerationStats::new(self.token_count, end.saturating_duration_since(self.started))
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[derive(Debug)]
pub struct RenderOutput {
    pub text: String,
    pub stats: GenerationStats,
}

/// The stream failed; `partial` is whatever arrived before the error.
#[derive(Debug)]
pub struct RenderFailure {
    pub error: GenerationError,
    pub partial: String,
}

/// Drain `deltas` in arrival order, calling `on_update` after every delta.
///
/// `on_update` can break to stop early; the output then holds what arrived so far.
pub async fn render<S>(
    deltas: S,
    mut on_update: impl FnMut(&StreamRenderer) -> ControlFlow<()>,
) -> Result<RenderOutput, RenderFailure>
where
    S: Stream<Item = Result<String, GenerationError>>,
{
    let mut renderer = StreamRenderer::new();
    futures_util::pin_mut!(deltas);

    while let Some(item) = deltas.next().await {
        match item {
            Ok(delta) => {
                renderer.push(&delta);
                if on_update(&renderer).is_break() {
                    debug!(received = renderer.token_count(), "consumer stopped the stream");
                    break;
                }
            }
            Err(error) => {
                debug!(received = renderer.token_count(), "stream failed mid-response");
                return Err(RenderFailure {
                    error,
                    partial: renderer.into_text(),
                });
            }
        }
    }

    let stats = renderer.stats();
    Ok(RenderOutput {
        text: renderer.into_text(),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn ok_chunks(chunks: &[&str]) -> Vec<Result<String, GenerationError>> {
        chunks.iter().map(|c| Ok(c.to_string())).collect()
    }

    #[test]
    fn test_incremental_matches_single_pass() {
        let samples = [
            "plain text",
            "some **bold** and `code`\nnext line",
            "intro\n```rust\nfn main() {\n    println!(\"hi\");\n}\n```\nafter **all**",
            "**open bold never closes",
        ];

        for sample in samples {
            let expected = markup::format(sample);
            let chars: Vec<char> = sample.chars().collect();
            for size in [1, 2, 3, 7] {
                let mut renderer = StreamRenderer::new();
                for chunk in chars.chunks(size) {
                    renderer.push(&chunk.iter().collect::<String>());
                }
                assert_eq!(renderer.text(), sample);
                assert_eq!(renderer.lines(), expected.as_slice(), "chunk size {size}");
            }
        }
    }

    #[test]
    fn test_bold_across_chunk_boundary() {
        let mut renderer = StreamRenderer::new();
        renderer.push("**bo");
        assert!(renderer.lines()[0]
            .spans
            .iter()
            .all(|s| matches!(s, markup::Span::Text(_))));
        renderer.push("ld**");
        assert_eq!(
            renderer.lines()[0].spans,
            vec![markup::Span::Strong("bold".to_string())]
        );
    }

    #[test]
    fn test_stats_never_non_finite() {
        let instant = GenerationStats::new(5, Duration::ZERO);
        assert_eq!(instant.tokens_per_second(), None);
        assert!(instant.to_string().contains("unavailable"));

        let sub_ms = GenerationStats::new(5, Duration::from_micros(900));
        assert_eq!(sub_ms.tokens_per_second(), None);

        let normal = GenerationStats::new(30, Duration::from_secs(2));
        assert_eq!(normal.tokens_per_second(), Some(15.0));
        assert_eq!(normal.to_string(), "Last response: 30 tokens in 2.0s (15.0 tok/s)");

        let empty = GenerationStats::new(0, Duration::from_secs(1));
        assert_eq!(empty.tokens_per_second(), Some(0.0));
    }

    #[tokio::test]
    async fn test_render_counts_deltas() {
        let mut updates = 0;
        let output = render(stream::iter(ok_chunks(&["Hi", " there", "!"])), |_| {
            updates += 1;
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

        assert_eq!(output.text, "Hi there!");
        assert_eq!(output.stats.token_count, 3);
        assert_eq!(updates, 3);
    }

    #[tokio::test]
    async fn test_render_failure_keeps_partial() {
        let items = vec![
            Ok("Partial".to_string()),
            Err(GenerationError::Engine("out of memory".to_string())),
            Ok("never seen".to_string()),
        ];
        let failure = render(stream::iter(items), |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();

        assert_eq!(failure.partial, "Partial");
        assert_eq!(failure.error.to_string(), "out of memory");
    }

    #[tokio::test]
    async fn test_render_stops_when_consumer_breaks() {
        let mut updates = 0;
        let output = render(stream::iter(ok_chunks(&["one", " two", " three"])), |r| {
            updates += 1;
            if r.token_count() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
        .unwrap();

        assert_eq!(updates, 2);
        assert_eq!(output.text, "one two");
        assert_eq!(output.stats.token_count, 2);
    }
}
