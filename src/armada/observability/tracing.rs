/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Span identifiers for reconcile passes. Passes run on the blocking pool,
//! so the active [`TraceContext`] lives in a thread-local rather than a
//! task-local; the logger reads it to stamp `trace_id` / `span_id` onto
//! every line emitted while a pass is in flight.

use rand::{rngs::OsRng, RngCore};
use std::cell::RefCell;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

thread_local! {
    static ACTIVE_TRACE: RefCell<Vec<TraceContext>> = const { RefCell::new(Vec::new()) };
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber exactly once.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let subscriber = Registry::default();
        // Another component may already own the global subscriber.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Returns the innermost active [`TraceContext`] on this thread, if any.
pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.with(|stack| stack.borrow().last().cloned())
}

/// Runs `f` inside a span. Nested spans inherit the parent's trace id and
/// get a fresh span id.
pub fn with_span<T>(component: &'static str, span_name: &str, f: impl FnOnce() -> T) -> T {
    let trace_id = current_context()
        .map(|ctx| ctx.trace_id.clone())
        .unwrap_or_else(|| Arc::<str>::from(random_hex(16)));
    let span_id = Arc::<str>::from(random_hex(8));
    let span = tracing::info_span!(
        "armada",
        component = component,
        span = span_name,
        trace_id = trace_id.as_ref(),
        span_id = span_id.as_ref(),
    );
    let _entered = span.enter();

    ACTIVE_TRACE.with(|stack| {
        stack.borrow_mut().push(TraceContext {
            trace_id,
            span_id,
        })
    });
    let _guard = PopOnDrop;
    f()
}

struct PopOnDrop;

impl Drop for PopOnDrop {
    fn drop(&mut self) {
        ACTIVE_TRACE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}
