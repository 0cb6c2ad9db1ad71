use std::time::Duration;

use crate::error::ClassifiedError;

pub(crate) fn record_ok(backend: &'static str, op: &'static str, elapsed: Duration) {
    let _ = (backend, op, elapsed);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!(
            "snipl_operations_total",
            "backend" => backend,
            "op" => op,
            "outcome" => "ok"
        )
        .increment(1);
        metrics::histogram!("snipl_operation_seconds", "backend" => backend, "op" => op)
            .record(elapsed.as_secs_f64());
    }

    #[cfg(feature = "tracing")]
    {
        tracing::debug!(
            backend,
            op,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "snipl operation ok"
        );
    }
}

pub(crate) fn record_err(
    backend: &'static str,
    op: &'static str,
    elapsed: Duration,
    err: &ClassifiedError,
) {
    let _ = (backend, op, elapsed, err);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!(
            "snipl_operations_total",
            "backend" => backend,
            "op" => op,
            "outcome" => "err"
        )
        .increment(1);
        metrics::counter!(
            "snipl_operation_errors_total",
            "backend" => backend,
            "op" => op,
            "kind" => err.kind().as_str()
        )
        .increment(1);
        metrics::histogram!("snipl_operation_seconds", "backend" => backend, "op" => op)
            .record(elapsed.as_secs_f64());
    }

    #[cfg(feature = "tracing")]
    {
        tracing::warn!(
            backend,
            op,
            kind = err.kind().as_str(),
            code = err.code().as_i32(),
            error = %err,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "snipl operation failed"
        );
    }
}

pub(crate) fn record_fallback(server: &str, from: &'static str, to: &'static str) {
    let _ = (server, from, to);

    #[cfg(feature = "metrics")]
    metrics::counter!("snipl_login_fallbacks_total").increment(1);

    #[cfg(feature = "tracing")]
    tracing::info!(server, from, to, "login failed, retrying with fallback backend");
}

pub(crate) fn record_downgrade(image: &str, message: &str) {
    let _ = (image, message);

    #[cfg(feature = "tracing")]
    tracing::info!(image, message, "benign return code downgraded to warning");
}
