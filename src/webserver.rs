use crate::report::{Reporter, ReporterStatus};
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};

pub async fn readiness_probe(State(reporter): State<Reporter>) -> impl IntoResponse {
    // Independent of cycle results, those are on /status
    if reporter.is_scheduler_running().await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn status(State(reporter): State<Reporter>) -> Json<ReporterStatus> {
    Json(reporter.status().await)
}

pub fn create_app(reporter: Reporter) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/status", get(status))
        .with_state(reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectivityError, CycleError};
    use crate::orchestrator::ServiceId;
    use crate::report::{CycleReport, Outcome, ServiceOutcome, SkipReason};
    use chrono::Utc;

    async fn serve(reporter: Reporter) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_app(reporter)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_probes_and_status() {
        let reporter = Reporter::new();
        let base = serve(reporter.clone()).await;
        let client = reqwest::Client::builder().no_proxy().build().unwrap();

        let live = client.get(format!("{}/health/live", base)).send().await.unwrap();
        assert_eq!(live.status().as_u16(), 204);

        let ready = client.get(format!("{}/health/ready", base)).send().await.unwrap();
        assert_eq!(ready.status().as_u16(), 503);

        // Ready before any cycle has completed
        reporter.set_scheduler_running(true).await;
        let ready = client.get(format!("{}/health/ready", base)).send().await.unwrap();
        assert_eq!(ready.status().as_u16(), 204);

        reporter
            .report(&CycleReport {
                started_at: Utc::now(),
                finished_at: Utc::now(),
                outcomes: vec![ServiceOutcome {
                    service: ServiceId {
                        kind: "Deployment".into(),
                        namespace: "default".into(),
                        name: "web".into(),
                        container: "app".into(),
                    },
                    name: "web".into(),
                    outcome: Outcome::Skipped(SkipReason::DigestUnchanged),
                }],
            })
            .await;

        let status: serde_json::Value = client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["last_cycle"]["checked"], 1);
        assert_eq!(status["last_cycle"]["skipped"]["digest_unchanged"], 1);
        assert!(status["last_abort_reason"].is_null());
        assert_eq!(status["scheduler_running"], true);
    }

    #[tokio::test]
    async fn test_ready_survives_aborted_cycles() {
        let reporter = Reporter::new();
        reporter.set_scheduler_running(true).await;
        reporter
            .report_aborted(&CycleError::Connectivity(ConnectivityError::Discovery(
                "forbidden: cannot list daemonsets".into(),
            )))
            .await;
        let base = serve(reporter.clone()).await;
        let client = reqwest::Client::builder().no_proxy().build().unwrap();

        let ready = client.get(format!("{}/health/ready", base)).send().await.unwrap();
        assert_eq!(ready.status().as_u16(), 204);

        reporter.set_scheduler_running(false).await;
        let ready = client.get(format!("{}/health/ready", base)).send().await.unwrap();
        assert_eq!(ready.status().as_u16(), 503);
    }
}
