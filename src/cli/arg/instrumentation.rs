use std::{error::Error, io::IsTerminal};

use eyre::WrapErr;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Logger {
    #[default]
    Compact,
    Full,
    Pretty,
    Json,
}

#[derive(clap::Args, Debug, Default)]
pub struct Instrumentation {
    /// Enable debug logs, -vv for trace
    #[clap(short = 'v', env = "KUNS_INSTALLER_VERBOSITY", long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Which logger to use
    #[clap(long, env = "KUNS_INSTALLER_LOGGER", default_value_t = Default::default(), global = true)]
    pub logger: Logger,
    /// Tracing directives
    ///
    /// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[clap(long = "log-directive", global = true, env = "KUNS_INSTALLER_LOG_DIRECTIVES", value_delimiter = ',', num_args = 0..)]
    pub log_directives: Vec<Directive>,
}

impl Instrumentation {
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn setup(&self) -> eyre::Result<()> {
        tracing_subscriber::registry()
            .with(self.fmt_layer())
            .with(self.filter_layer()?)
            .with(ErrorLayer::default())
            .try_init()?;

        Ok(())
    }

    /// The formatter selected with `--logger`, always writing to stderr so stdout stays clean for `plan` and `list-disks`
    pub fn fmt_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    {
        let layer = tracing_subscriber::fmt::Layer::new()
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr);

        match self.logger {
            Logger::Compact => layer
                .compact()
                .without_time()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .boxed(),
            Logger::Full => layer.boxed(),
            Logger::Pretty => layer.pretty().boxed(),
            Logger::Json => layer.json().boxed(),
        }
    }

    pub fn filter_layer(&self) -> eyre::Result<EnvFilter> {
        let mut filter_layer = match EnvFilter::try_from_default_env() {
            Ok(layer) => layer,
            Err(e) => {
                // Catch a parse error and report it, ignore a missing env.
                if let Some(source) = e.source() {
                    match source.downcast_ref::<std::env::VarError>() {
                        Some(std::env::VarError::NotPresent) => (),
                        _ => return Err(e).wrap_err_with(|| "parsing RUST_LOG directives"),
                    }
                }
                EnvFilter::try_new(format!(
                    "{}={}",
                    env!("CARGO_PKG_NAME").replace('-', "_"),
                    self.log_level()
                ))?
            },
        };

        for directive in &self.log_directives {
            filter_layer = filter_layer.add_directive(directive.clone());
        }

        Ok(filter_layer)
    }
}
