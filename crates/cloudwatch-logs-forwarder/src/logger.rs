// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format of the forwarder.
//!
//! Logs go to stderr, one line per event:
//!
//! ```text
//! CW_LOGS | WARN | commit | failed to PutLogEvents: Rate exceeded group=app stream=web attempt=2
//! ```
//!
//! The third column is the module that emitted the event (`poller`,
//! `commit`, `http`, ...). Commit and poll events carry the destination as
//! `group` and `stream` fields, retries add `attempt` and `next_retry`.
//! Stdout stays reserved for forwarded records.

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext,
};
use tracing_subscriber::registry::LookupSpan;

const PREFIX: &str = "CW_LOGS";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let target = metadata.target();
        let component = target.rsplit("::").next().unwrap_or(target);
        write!(&mut writer, "{PREFIX} | {} | {component} | ", metadata.level())?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
