//! Terminal report renderer.
//!
//! Pure presentation: the executor hands over the frozen aggregate map and
//! this module derives the human-readable summary — totals up front, then one
//! dot-padded line per key with the latency quantiles, handshake breakdowns
//! for HTTP endpoints, and pass/fail rates for checks. No aggregation logic
//! lives here.

use std::time::Duration;

use colored::Colorize;

use crate::aggregate::{AggregateKind, AggregateMap, EndpointAggregate};

const KEY_WIDTH: usize = 40;

/// Render the end-of-run report to stdout.
///
/// A run that collected nothing still prints the summary with zero totals.
pub fn render(aggregates: &mut AggregateMap) {
    print_summary(aggregates);

    if aggregates.is_empty() {
        return;
    }

    println!("{}", "\nDetailed Report:".green().bold());
    for (key, aggregate) in aggregates.iter_mut() {
        match aggregate.kind {
            AggregateKind::Check => print_check_line(key, aggregate),
            AggregateKind::HttpRequest => {
                print_latency_line(key, aggregate);
                print_handshake_lines(aggregate);
                print_status_line(aggregate);
            }
            AggregateKind::Group => print_latency_line(key, aggregate),
        }
    }
}

fn print_summary(aggregates: &AggregateMap) {
    println!("{}", "\n=== Performance Test Report ===".cyan().bold());
    println!("{}", "\nSummary:".green().bold());

    let mut total_requests = 0u64;
    let mut total_errors = 0u64;
    let mut total_duration = Duration::ZERO;
    for aggregate in aggregates.values() {
        total_requests += aggregate.total_requests;
        total_errors += aggregate.total_errors;
        total_duration += aggregate.total_response_time;
    }

    println!("  Total Requests       : {total_requests}");
    println!("  Total Errors         : {total_errors}");
    println!("  Total Duration       : {}", format_duration(total_duration));
    if total_requests > 0 {
        println!(
            "  Average Duration     : {}",
            format_duration(total_duration.div_f64(total_requests as f64))
        );
    } else {
        println!("  Average Duration     : N/A");
    }
}

fn print_latency_line(key: &str, aggregate: &mut EndpointAggregate) {
    let avg = if aggregate.total_requests > 0 {
        aggregate
            .total_response_time
            .div_f64(aggregate.total_requests as f64)
    } else {
        Duration::ZERO
    };

    println!(
        "  {}{}: avg={}  min={}  med={}  max={}  p(90)={}  p(95)={}",
        key,
        dots_for(key),
        format_duration(avg),
        format_duration(aggregate.response_times.quantile_duration(0.0)),
        format_duration(aggregate.response_times.quantile_duration(0.5)),
        format_duration(aggregate.response_times.quantile_duration(1.0)),
        format_duration(aggregate.response_times.quantile_duration(0.9)),
        format_duration(aggregate.response_times.quantile_duration(0.95)),
    );
}

fn print_handshake_lines(aggregate: &mut EndpointAggregate) {
    let mut lines: Vec<(&str, &mut crate::sketch::LatencySketch)> = vec![
        ("tcp handshake", &mut aggregate.tcp_handshake),
        ("dns lookup", &mut aggregate.dns_lookup),
        ("tls handshake", &mut aggregate.tls_handshake),
    ];
    for (label, sketch) in lines.iter_mut() {
        if sketch.is_empty() {
            continue;
        }
        println!(
            "  {:>width$}: min={}  med={}  max={}  p(90)={}  p(95)={}",
            label,
            format_duration(sketch.quantile_duration(0.0)),
            format_duration(sketch.quantile_duration(0.5)),
            format_duration(sketch.quantile_duration(1.0)),
            format_duration(sketch.quantile_duration(0.9)),
            format_duration(sketch.quantile_duration(0.95)),
            width = KEY_WIDTH,
        );
    }
}

fn print_status_line(aggregate: &EndpointAggregate) {
    if aggregate.status_code_counts.is_empty() {
        return;
    }
    let codes = aggregate
        .status_code_counts
        .iter()
        .map(|(code, count)| format!("{code}: {count}"))
        .collect::<Vec<_>>()
        .join(", ");
    println!("  {:>width$}: {codes}", "status codes", width = KEY_WIDTH);
}

fn print_check_line(key: &str, aggregate: &EndpointAggregate) {
    let total = aggregate.checks_passed + aggregate.checks_failed;
    let (pass_rate, fail_rate) = if total > 0 {
        (
            aggregate.checks_passed as f64 / total as f64 * 100.0,
            aggregate.checks_failed as f64 / total as f64 * 100.0,
        )
    } else {
        (0.0, 0.0)
    };
    println!(
        "  {}{}: passed={}  failed={}  (pass {:.1}%, fail {:.1}%)",
        key,
        dots_for(key),
        aggregate.checks_passed,
        aggregate.checks_failed,
        pass_rate,
        fail_rate,
    );
}

fn dots_for(key: &str) -> String {
    ".".repeat(KEY_WIDTH.saturating_sub(key.len()))
}

fn format_duration(duration: Duration) -> String {
    let ms = duration.as_secs_f64() * 1000.0;
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{ms:.2}ms")
    }
}
