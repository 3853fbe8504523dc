// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use crate::ResilienceError;

/// Run `fut` with a hard deadline.  The in-flight future is dropped (and
/// thereby cancelled at its next suspension point) when the deadline passes.
pub async fn with_timeout<F: Future>(deadline: Duration, fut: F) -> Result<F::Output, ResilienceError> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| ResilienceError::Timeout(deadline))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
