use crate::handler::middleware::clientaddr::ClientAddr;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::CONTENT_LENGTH, Request},
    middleware::Next,
    response::Response,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::field::{Field, Visit};
use tracing::{info, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{format, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const ACCESS_TARGET: &str = "http.access";

/// Attached to a response by handlers that resolved a deal, so the access
/// line can name it.
#[derive(Debug, Clone)]
pub struct AccessNote {
    pub deal_id: String,
    pub outcome: String,
}

/// Renders `http.access` events as one pipe-separated line and every other
/// event with the default formatter.
#[derive(Clone, Default)]
pub struct AccessLogEventFormat<T = SystemTime> {
    timer: T,
}

impl<T> AccessLogEventFormat<T>
where
    T: FormatTime,
{
    pub fn new(timer: T) -> Self {
        Self { timer }
    }
}

#[derive(Default)]
struct AccessLine {
    client_ip: Option<String>,
    method: Option<String>,
    status: Option<u64>,
    body_len: Option<String>,
    cost_ms: Option<f64>,
    uri: Option<String>,
    deal_id: Option<String>,
    outcome: Option<String>,
}

impl AccessLine {
    fn text_slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "client_ip" => Some(&mut self.client_ip),
            "method" => Some(&mut self.method),
            "body_len" => Some(&mut self.body_len),
            "uri" => Some(&mut self.uri),
            "deal_id" => Some(&mut self.deal_id),
            "outcome" => Some(&mut self.outcome),
            _ => None,
        }
    }

    fn write_to(&self, writer: &mut Writer<'_>) -> std::fmt::Result {
        let dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let cost = self
            .cost_ms
            .map(|ms| format!("{ms:.3}ms"))
            .unwrap_or_else(|| "-".to_string());
        write!(
            writer,
            "{} | {} | {} | {} | {} | {}",
            dash(&self.client_ip),
            dash(&self.method),
            status,
            dash(&self.body_len),
            cost,
            dash(&self.uri),
        )?;
        if let Some(deal_id) = &self.deal_id {
            write!(writer, " | deal={} {}", deal_id, dash(&self.outcome))?;
        }
        writeln!(writer)
    }
}

impl Visit for AccessLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.text_slot(field.name()) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if let Some(slot) = self.text_slot(field.name()) {
            *slot = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "status" {
            self.status = Some(value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "status" {
            self.status = u64::try_from(value).ok();
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == "cost_ms" {
            self.cost_ms = Some(value);
        }
    }
}

impl<S, N, T> FormatEvent<S, N> for AccessLogEventFormat<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
    T: FormatTime + Clone,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != ACCESS_TARGET {
            return format::Format::default()
                .with_timer(self.timer.clone())
                .with_target(true)
                .with_source_location(false)
                .format_event(ctx, writer, event);
        }

        let mut line = AccessLine::default();
        event.record(&mut line);
        self.timer.format_time(&mut writer)?;
        write!(writer, " {} {} | ", metadata.level(), metadata.target())?;
        line.write_to(&mut writer)
    }
}

fn should_skip_logging(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    })
}

/// Logs one access line per request once the handler returns. Paths in
/// `skip_paths` match exactly, or by prefix when they end with `*`.
pub async fn log_requests(
    State(skip_paths): State<Arc<Vec<String>>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if should_skip_logging(req.uri().path(), skip_paths.as_slice()) {
        return next.run(req).await;
    }

    let started_at = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let connect_info = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = ClientAddr::from_http_parts(req.headers(), connect_info)
        .ip()
        .to_string();

    let response = next.run(req).await;

    let body_len = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let note = response.extensions().get::<AccessNote>();
    info!(
        target: ACCESS_TARGET,
        client_ip = client_ip.as_str(),
        method = method.as_str(),
        status = response.status().as_u16(),
        body_len = body_len.as_str(),
        cost_ms = started_at.elapsed().as_secs_f64() * 1_000.0,
        uri = uri.as_str(),
        deal_id = note.map(|n| n.deal_id.as_str()),
        outcome = note.map(|n| n.outcome.as_str()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::should_skip_logging;

    #[test]
    fn test_skip_patterns() {
        let patterns = vec!["/health".to_string(), "/static/*".to_string()];
        assert!(should_skip_logging("/health", &patterns));
        assert!(should_skip_logging("/static/app.js", &patterns));
        assert!(!should_skip_logging("/health/deep", &patterns));
        assert!(!should_skip_logging("/verificar-ura", &patterns));
        assert!(!should_skip_logging("/verificar-ura", &[]));
    }
}
