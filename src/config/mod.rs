pub mod loader;
pub mod settings;

pub use loader::{load_config, validate_config};
pub use settings::{
    AggregationSettings, AggregationWindow, FetcherSettings, GapPolicy, IndicatorKind,
    IndicatorSettings, IndicatorSpec, PipelineConfig, SchedulerSettings, StoreSettings,
};
