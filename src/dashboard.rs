//! Optional live dashboard.
//!
//! When enabled, an embedded HTTP server exposes the run's instantaneous
//! per-endpoint latency: `GET /` serves a self-contained page that polls
//! `GET /metrics` once per second and renders one line chart per measurement
//! key. The collector feeds the shared live map; this module only reads it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};

/// Last observed response latency (ms) per measurement key.
pub type LiveMetrics = Arc<RwLock<HashMap<String, f64>>>;

pub const DEFAULT_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 8080);

pub fn new_live_metrics() -> LiveMetrics {
    Arc::new(RwLock::new(HashMap::new()))
}

pub async fn serve(live: LiveMetrics, addr: SocketAddr) -> Result<(), hyper::Error> {
    let app = Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .with_state(live);

    tracing::info!(%addr, "dashboard listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
}

async fn index() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn metrics(State(live): State<LiveMetrics>) -> Json<serde_json::Value> {
    let snapshot = live
        .read()
        .map(|metrics| metrics.clone())
        .unwrap_or_default();

    let mut body = serde_json::Map::new();
    for (key, latency_ms) in snapshot {
        body.insert(key, serde_json::json!({ "realtimeResponse": latency_ms }));
    }
    Json(serde_json::Value::Object(body))
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Accelira Dashboard</title>
    <style>
        body {
            font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif;
            background-color: #e0e5e8;
            color: #333;
            margin: 0;
            padding: 0;
        }
        .container {
            max-width: 1200px;
            margin: 40px auto;
            padding: 20px;
            background-color: white;
            border-radius: 12px;
            box-shadow: 0 4px 12px rgba(0,0,0,0.1);
        }
        h1 {
            font-size: 2.5em;
            margin-top: 0;
            border-bottom: 2px solid #007bff;
            padding-bottom: 10px;
        }
        #charts {
            margin-top: 30px;
            display: flex;
            flex-wrap: wrap;
            gap: 15px;
        }
        .chart-container {
            flex: 1 1 calc(33% - 30px);
            min-width: 300px;
            padding: 15px;
            background-color: #ffffff;
            border-radius: 8px;
            box-shadow: 0 2px 6px rgba(0,0,0,0.1);
        }
        #metrics {
            margin-top: 20px;
            white-space: pre-wrap;
            font-family: monospace;
            background-color: #f8f9fa;
            padding: 15px;
            border-radius: 8px;
        }
    </style>
    <script src="https://cdn.jsdelivr.net/npm/chart.js"></script>
</head>
<body>
    <div class="container">
        <h1>Accelira Performance Dashboard</h1>
        <div id="charts"></div>
        <div id="metrics">Loading metrics...</div>
        <script>
            const charts = {};

            function downsample(data, maxLength) {
                if (data.length <= maxLength) return data;
                const interval = Math.ceil(data.length / maxLength);
                return data.filter((_, index) => index % interval === 0);
            }

            async function fetchMetrics() {
                const response = await fetch('/metrics');
                if (!response.ok) {
                    throw new Error('Failed to fetch metrics');
                }
                const data = await response.json();
                document.getElementById('metrics').textContent = JSON.stringify(data, null, 2);
                const chartsDiv = document.getElementById('charts');

                for (let endpoint in data) {
                    const chartId = 'chart-' + endpoint.replace(/[^a-zA-Z0-9]/g, '-');
                    if (!charts[chartId]) {
                        const container = document.createElement('div');
                        container.className = 'chart-container';
                        container.innerHTML = '<h2>' + endpoint + '</h2><canvas id="' + chartId + '"></canvas>';
                        chartsDiv.appendChild(container);

                        const ctx = document.getElementById(chartId).getContext('2d');
                        charts[chartId] = new Chart(ctx, {
                            type: 'line',
                            data: {
                                labels: [],
                                datasets: [{
                                    label: 'Real-time Response (ms)',
                                    data: [],
                                    borderColor: 'rgba(75, 192, 192, 1)',
                                    borderWidth: 2,
                                    fill: false,
                                }]
                            },
                            options: {
                                responsive: true,
                                scales: {
                                    x: { ticks: { autoSkip: true, maxTicksLimit: 10 } },
                                    y: { beginAtZero: true, title: { display: true, text: 'Latency (ms)' } }
                                }
                            }
                        });
                    }

                    const chart = charts[chartId];
                    chart.data.labels.push(new Date().toLocaleTimeString());
                    chart.data.datasets[0].data.push(data[endpoint]['realtimeResponse']);
                    if (chart.data.labels.length > 50) {
                        chart.data.labels = downsample(chart.data.labels, 50);
                        chart.data.datasets[0].data = downsample(chart.data.datasets[0].data, 50);
                    }
                    chart.update();
                }
            }

            setInterval(() => {
                fetchMetrics().catch((error) => console.error('Error fetching metrics:', error));
            }, 1000);
        </script>
    </div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_serializes_the_live_map() {
        let live = new_live_metrics();
        live.write()
            .unwrap()
            .insert("GET http://x/".to_string(), 12.5);

        let Json(body) = metrics(State(live)).await;
        assert_eq!(body["GET http://x/"]["realtimeResponse"], 12.5);
    }

    #[test]
    fn page_polls_the_metrics_endpoint() {
        assert!(DASHBOARD_HTML.contains("fetch('/metrics')"));
        assert!(DASHBOARD_HTML.contains("1000"));
    }
}
