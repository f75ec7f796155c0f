//! Small command line front end.
//!
//! ```text
//! tessera                          list classes of the configured store
//! tessera <config>                 same, with settings from a config file
//! tessera <class> <criteria>       print the ids meeting the criteria
//! tessera <config> <class> <criteria>
//! ```
//!
//! `TESSERA__SECTION__KEY` environment variables override the config file,
//! and `RUST_LOG` overrides the configured log filter.

use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera::Result;
use tessera::config::StoreConfig;
use tessera::construct::Database;

fn run(args: &[String]) -> Result<()> {
    let (config_path, query) = match args {
        [] => (None, None),
        [config] => (Some(config.as_str()), None),
        [class, criteria] => (None, Some((class, criteria))),
        [config, class, criteria, ..] => (Some(config.as_str()), Some((class, criteria))),
    };
    let config = StoreConfig::load(config_path)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = Database::from_config(&config)?;
    match query {
        Some((class, criteria)) => {
            for object in db.objects_of_class_that_meet_criteria(class, criteria)? {
                println!("{object}");
            }
        }
        None => {
            for class in db.get_all_classes()? {
                println!("{class}\t{}", db.get_all_objects_of_class(&class)?.len());
            }
        }
    }
    info!("done");
    db.close()
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
