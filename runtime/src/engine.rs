//! Watch-event reconciliation.
//!
//! For ADDED and UPDATED streams, every tag whose most recent digest differs
//! from the materialized pointer gets a background materialization. DELETED
//! streams retire every digest in each tag's history along with the
//! reference itself.

use std::sync::Arc;

use explode_core::{Digest, ImageReference, ImageStream, WatchEvent, WatchEventKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::context::ExplodeContext;
use crate::gc::GcSweeper;
use crate::materializer::{checkout_state, CheckoutState, LayerMaterializer};
use crate::refstore::RefStore;

/// What the engine decided for one tag of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The pointer is stale; `current` is what it holds now.
    Materialize {
        reference: ImageReference,
        digest: Digest,
        current: Option<Digest>,
    },
    UpToDate {
        reference: ImageReference,
    },
    /// The tag was pulled through from a foreign registry.
    IgnoredPullthrough {
        reference: ImageReference,
    },
    /// The tag cannot be acted on.
    Invalid {
        tag: String,
        reason: String,
    },
}

/// Turns watch events into materialization and GC tasks.
pub struct ReconcileEngine {
    materializer: Arc<LayerMaterializer>,
    sweeper: Arc<GcSweeper>,
    refs: Arc<RefStore>,
    registry_host: String,
}

impl ReconcileEngine {
    pub fn new(ctx: &ExplodeContext) -> Self {
        Self {
            materializer: Arc::new(ctx.materializer()),
            sweeper: Arc::new(ctx.sweeper()),
            refs: ctx.refs.clone(),
            registry_host: ctx.registry_host.clone(),
        }
    }

    /// Whether `pull_spec` was not pushed to the local registry.
    pub fn is_pullthrough(&self, pull_spec: &str) -> bool {
        !pull_spec.starts_with(&format!("{}/", self.registry_host))
    }

    /// Compare every tag of `stream` against the stored pointers.
    pub async fn decide(&self, stream: &ImageStream) -> Vec<Decision> {
        let mut decisions = Vec::with_capacity(stream.tags.len());
        for (tag, history) in &stream.tags {
            let reference = match stream.reference(tag) {
                Ok(reference) => reference,
                Err(e) => {
                    decisions.push(Decision::Invalid {
                        tag: tag.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let Some(latest) = history.first() else {
                decisions.push(Decision::Invalid {
                    tag: tag.clone(),
                    reason: "empty tag history".to_string(),
                });
                continue;
            };

            if self.is_pullthrough(&latest.docker_image_reference) {
                decisions.push(Decision::IgnoredPullthrough { reference });
                continue;
            }

            let digest = match Digest::parse(&latest.image) {
                Ok(digest) => digest,
                Err(e) => {
                    decisions.push(Decision::Invalid {
                        tag: tag.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let current = self.refs.digest_for(&reference).await;
            if current.as_ref() == Some(&digest) && self.is_materialized(&digest).await {
                decisions.push(Decision::UpToDate { reference });
            } else {
                decisions.push(Decision::Materialize {
                    reference,
                    digest,
                    current,
                });
            }
        }
        decisions
    }

    /// Whether the checkout for `digest` is complete. Unreadable state
    /// counts as not materialized.
    async fn is_materialized(&self, digest: &Digest) -> bool {
        matches!(
            checkout_state(self.refs.layout(), digest).await,
            Ok(CheckoutState::Complete)
        )
    }

    /// Dispatch the work for one event without waiting for it.
    pub async fn handle(&self, event: WatchEvent) -> Vec<JoinHandle<()>> {
        let WatchEvent { kind, stream } = event;
        if stream.tags.is_empty() {
            tracing::debug!(
                event = %kind,
                image = %stream.docker_image_repository,
                "No tags"
            );
            return Vec::new();
        }

        match kind {
            WatchEventKind::Added | WatchEventKind::Updated => {
                self.dispatch_materializations(kind, &stream).await
            }
            WatchEventKind::Deleted => self.dispatch_retirements(&stream),
        }
    }

    async fn dispatch_materializations(
        &self,
        kind: WatchEventKind,
        stream: &ImageStream,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for decision in self.decide(stream).await {
            match decision {
                Decision::Materialize {
                    reference,
                    digest,
                    current,
                } => {
                    let message = match kind {
                        WatchEventKind::Added => "New tag",
                        _ => "Updated tag",
                    };
                    tracing::info!(
                        event = %kind,
                        reference = %reference,
                        digest = %digest,
                        previous = current.as_ref().map(Digest::as_str).unwrap_or(""),
                        "{}",
                        message
                    );

                    let materializer = self.materializer.clone();
                    handles.push(tokio::spawn(async move {
                        if let Err(e) = materializer.explode(&reference, &digest).await {
                            tracing::error!(
                                reference = %reference,
                                digest = %digest,
                                stage = e.stage(),
                                error = %e,
                                "Materialization failed"
                            );
                        }
                    }));
                }
                Decision::UpToDate { reference } => {
                    tracing::trace!(reference = %reference, "Up to date");
                }
                Decision::IgnoredPullthrough { reference } => {
                    tracing::debug!(event = %kind, reference = %reference, "Ignoring pullthrough");
                }
                Decision::Invalid { tag, reason } => {
                    tracing::warn!(
                        event = %kind,
                        namespace = %stream.namespace,
                        name = %stream.name,
                        tag = %tag,
                        reason = %reason,
                        "Skipping tag"
                    );
                }
            }
        }
        handles
    }

    fn dispatch_retirements(&self, stream: &ImageStream) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (tag, history) in &stream.tags {
            let reference = match stream.reference(tag) {
                Ok(reference) => reference,
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "Skipping tag");
                    continue;
                }
            };
            let digests: Vec<Digest> = history
                .iter()
                .filter_map(|event| match Digest::parse(&event.image) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        tracing::warn!(reference = %reference, error = %e, "Skipping history entry");
                        None
                    }
                })
                .collect();

            let sweeper = self.sweeper.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = sweeper.retire(&reference, &digests).await {
                    tracing::error!(
                        reference = %reference,
                        stage = e.stage(),
                        error = %e,
                        "Retirement failed"
                    );
                }
            }));
        }
        handles
    }

    /// Consume events until the channel closes or shutdown is signalled,
    /// then wait for in-flight tasks.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut inflight: Vec<JoinHandle<()>> = Vec::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        inflight.retain(|handle| !handle.is_finished());
                        inflight.extend(self.handle(event).await);
                    }
                    None => {
                        tracing::info!("Watch stream closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if !inflight.is_empty() {
            tracing::info!(tasks = inflight.len(), "Waiting for in-flight tasks");
        }
        for handle in inflight {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Task did not complete");
            }
        }
    }
}
