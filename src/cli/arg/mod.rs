mod instrumentation;
pub use instrumentation::Instrumentation;
mod settings;
pub use settings::SettingsArgs;
