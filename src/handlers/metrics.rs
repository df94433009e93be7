//! Prometheus metrics endpoint (§4.L, §4.M).

use axum::{extract::State, http::StatusCode};

use crate::handlers::AppState;

pub async fn handler(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics().gather() {
        Ok(output) => (StatusCode::OK, output),
        Err(e) => {
            tracing::error!(error = %e, "failed to gather metrics for scraping");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to gather metrics: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn sample_config() -> Arc<Config> {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 3000

            [[endpoints]]
            name = "primary"
            url = "https://api.anthropic.com"
            token = "sk-test"
            priority = 1
            group = "main"
            group_priority = 1
        "#;
        Arc::new(toml::from_str(toml_str).unwrap())
    }

    #[tokio::test]
    async fn handler_returns_prometheus_text() {
        let state = AppState::new(sample_config()).unwrap();
        let (status, body) = handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("requests_total"));
    }
}
