use crate::error::HookError;
use crate::hook::Hook;
use crate::layer::HookLayer;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Конфигурация подключения хука к `tracing`.
///
/// **Поля**
/// - `enable_stdout`: если `true`, поверх [`HookLayer`] добавляется
///   `tracing_subscriber::fmt::Layer` и события печатаются в консоль.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { enable_stdout: true }
    }
}

/// Install a global `tracing` subscriber that forwards events to `hook`.
///
/// **Parameters**
/// - `hook`: configured [`Hook`]; configuration is frozen from here on
///   since the hook is shared.
/// - `config`: [`LayerConfig`] controlling the extra console output.
///
/// **Errors**
/// - [`HookError::NoRuntime`] when called outside a tokio runtime.
/// - [`HookError::SubscriberInit`] when a global subscriber is already set.
pub fn init_tracing_with_config(hook: Arc<Hook>, config: LayerConfig) -> Result<(), HookError> {
    let layer = HookLayer::new(hook)?;

    // Два варианта subscriber'а нужны только ради совместимости типов.
    let result = if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|e| HookError::SubscriberInit(e.to_string()))
}

/// Equivalent to [`init_tracing_with_config`] with [`LayerConfig::default`].
pub fn init_tracing(hook: Arc<Hook>) -> Result<(), HookError> {
    init_tracing_with_config(hook, LayerConfig::default())
}
