//! Spawns the asynchronous side of a session.
//!
//! Each task reports back over an unbounded channel as [`SessionEvent`]s.
//! The receiving loop owns the [`Session`](crate::session::Session) and is
//! the only place state changes; tasks never touch it directly.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{self, GpuHost};
use crate::engine::{EngineHandle, InferenceEngine, ProgressEvent};
use crate::models::Model;
use crate::session::{GenerationRequest, SessionEvent};

fn send<E: From<SessionEvent>>(tx: &UnboundedSender<E>, event: SessionEvent) -> bool {
    tx.send(event.into()).is_ok()
}

pub fn spawn_probe<E>(host: Box<dyn GpuHost>, tx: UnboundedSender<E>) -> JoinHandle<()>
where
    E: From<SessionEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let report = capability::probe(host.as_ref()).await;
        send(&tx, SessionEvent::Probed(report));
    })
}

pub fn spawn_load<E>(
    engine: Arc<dyn InferenceEngine>,
    model: Model,
    tx: UnboundedSender<E>,
) -> JoinHandle<()>
where
    E: From<SessionEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let mut on_progress = move |progress: ProgressEvent| {
            send(&progress_tx, SessionEvent::LoadProgress(progress));
        };
        let result = engine.load(model.as_str(), &mut on_progress).await;
        send(&tx, SessionEvent::Loaded(result));
    })
}

/// Stream one reply. Deltas stop being forwarded once the request is abandoned.
pub fn spawn_generation<E>(request: GenerationRequest, tx: UnboundedSender<E>) -> JoinHandle<()>
where
    E: From<SessionEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let GenerationRequest {
            id,
            handle,
            history,
            params,
            abandoned,
        } = request;

        let mut stream = match handle.stream_chat(&history, &params).await {
            Ok(stream) => stream,
            Err(error) => {
                send(
                    &tx,
                    SessionEvent::Finished {
                        generation: id,
                        result: Err(error),
                    },
                );
                return;
            }
        };

        while let Some(item) = stream.next().await {
            if abandoned.load(Ordering::Acquire) {
                debug!(generation = ?id, "generation abandoned; dropping stream");
                return;
            }
            match item {
                Ok(text) => {
                    if !send(&tx, SessionEvent::Delta { generation: id, text }) {
                        return;
                    }
                }
                Err(error) => {
                    send(
                        &tx,
                        SessionEvent::Finished {
                            generation: id,
                            result: Err(error),
                        },
                    );
                    return;
                }
            }
        }

        send(
            &tx,
            SessionEvent::Finished {
                generation: id,
                result: Ok(()),
            },
        );
    })
}

/// Release a handle handed back by `Session::unload`. Failures are only logged.
pub fn spawn_unload(handle: Arc<dyn EngineHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match handle.unload().await {
            Ok(()) => info!(model = handle.model(), "engine released model"),
            Err(e) => warn!(model = handle.model(), error = %e, "failed to unload model"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChatParams, DeltaStream};
    use crate::error::{EngineError, GenerationError};
    use crate::session::Session;
    use crate::state::ChatMessage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    struct Scripted(Vec<&'static str>);

    #[async_trait]
    impl EngineHandle for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn stream_chat(
            &self,
            _history: &[ChatMessage],
            _params: &ChatParams,
        ) -> Result<DeltaStream, GenerationError> {
            let items: Vec<_> = self.0.iter().map(|s| Ok(s.to_string())).collect();
            Ok(Box::pin(futures_util::stream::iter(items)))
        }

        async fn unload(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn request(abandoned: bool) -> (Session, GenerationRequest) {
        let mut session = Session::new(Model::DEFAULT, ChatParams::default());
        session.handle_event(SessionEvent::Probed(
            crate::capability::CapabilityReport::ready("gpu"),
        ));
        session.begin_load().unwrap();
        session.handle_event(SessionEvent::Loaded(Ok(Arc::new(Scripted(vec![
            "a", "b", "c",
        ])))));
        let request = session.submit("go").unwrap();
        request.abandoned.store(abandoned, Ordering::Release);
        (session, request)
    }

    #[tokio::test]
    async fn test_generation_forwards_deltas_then_finishes() {
        let (mut session, request) = request(false);
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        spawn_generation(request, tx).await.unwrap();

        let mut deltas = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Delta { .. }) {
                deltas += 1;
            }
            session.handle_event(event);
        }
        assert_eq!(deltas, 3);
        assert_eq!(session.history().messages()[1].content, "abc");
    }

    #[tokio::test]
    async fn test_abandoned_generation_sends_nothing() {
        let (_session, request) = request(true);
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        spawn_generation(request, tx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_generation_stops_when_receiver_gone() {
        let (_session, request) = request(false);
        let flag: Arc<AtomicBool> = request.abandoned.clone();
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
        drop(rx);
        spawn_generation(request, tx).await.unwrap();
        assert!(!flag.load(Ordering::Acquire));
    }
}
