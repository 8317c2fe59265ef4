//! 健康检查探针
//!
//! 任意路径都返回 `200 OK`，安装了Prometheus记录器时 `/metrics` 输出指标。

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cuniculus_core::HealthCheckConfig;
use cuniculus_errors::{CuniculusError, CuniculusResult};

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// 安装全局Prometheus记录器，进程内只安装一次
///
/// 已有其他全局记录器时返回None。
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("安装Prometheus记录器失败，/metrics不可用: {}", e);
                None
            }
        })
        .clone()
}

pub struct HealthCheckServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl HealthCheckServer {
    /// 绑定地址并在后台提供服务，端口为0时由系统分配
    pub async fn start(
        config: &HealthCheckConfig,
        metrics: Option<PrometheusHandle>,
    ) -> CuniculusResult<Self> {
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            CuniculusError::config_error(format!("健康检查绑定地址 {addr} 失败: {e}"))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CuniculusError::Internal(format!("获取健康检查监听地址失败: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(metrics);
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("健康检查服务运行失败: {}", e);
            }
        });

        info!("健康检查服务启动在 http://{}", local_addr);
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.handle.await {
            warn!("健康检查服务退出异常: {}", e);
        }
        info!("健康检查服务已停止");
    }
}

fn router(metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new();
    let router = match metrics {
        Some(handle) => router.route("/metrics", get(render_metrics).with_state(handle)),
        None => router,
    };
    router.fallback(ok)
}

async fn ok() -> &'static str {
    "OK"
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            bind_to: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_any_path_returns_ok() {
        let server = HealthCheckServer::start(&local_config(), None).await.unwrap();
        let base = format!("http://{}", server.local_addr());

        for path in ["/", "/healthz", "/anything/else"] {
            let response = reqwest::get(format!("{base}{path}")).await.unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(response.text().await.unwrap(), "OK");
        }

        server.stop().await;
        assert!(reqwest::get(format!("{base}/")).await.is_err());
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_counters() {
        let handle = prometheus_handle().expect("recorder installed");
        metrics::counter!("cuniculus_health_check_test_total").increment(1);

        let server = HealthCheckServer::start(&local_config(), Some(handle))
            .await
            .unwrap();
        let body = reqwest::get(format!("http://{}/metrics", server.local_addr()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        server.stop().await;

        assert!(body.contains("cuniculus_health_check_test_total"));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = HealthCheckServer::start(&local_config(), None).await.unwrap();
        let taken = HealthCheckConfig {
            port: first.local_addr().port(),
            ..local_config()
        };

        let err = HealthCheckServer::start(&taken, None).await.err().unwrap();
        assert!(matches!(err, CuniculusError::Configuration(_)));
        first.stop().await;
    }
}
