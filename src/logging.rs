//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Environment;

/// Directives used when `RUST_LOG` is unset. Job and pipeline targets stay
/// at debug outside production so stage transitions are visible.
pub fn default_directives(env: &Environment) -> &'static str {
    match env {
        Environment::Dev => {
            "roofscope_pipeline=debug,tower_http=debug,sqlx=warn,info"
        }
        Environment::Staging => {
            "roofscope_pipeline::jobs=debug,roofscope_pipeline::pipeline=debug,roofscope_pipeline=info,sqlx=warn,info"
        }
        Environment::Prod => "roofscope_pipeline=info,tower_http=warn,sqlx=warn,warn",
    }
}

/// Install the global subscriber: JSON lines in production, pretty output otherwise.
pub fn init_logging(env: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(env)));
    let registry = tracing_subscriber::registry().with(filter);

    match env {
        Environment::Prod => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init(),
        _ => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(env.is_dev())
                    .with_line_number(env.is_dev()),
            )
            .init(),
    }

    tracing::info!(env = ?env, "Logging initialized");
}
