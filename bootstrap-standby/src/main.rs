mod bootstrap_cli;

use std::env;
use std::path::PathBuf;
use tokio::runtime::Runtime;

use crate::bootstrap_cli::{
    run_bootstrap, BootstrapCliOptions, DEFAULT_BOOTSTRAP_CONFIG_PATH,
};

fn usage() -> String {
    format!(
        "usage: bootstrap-standby [--config <path>] [--force] [--non-interactive]\n\
         \x20                        [--skip-shared-edits-check] [--rolling-upgrade]\n\
         defaults:\n\
         --config {}",
        DEFAULT_BOOTSTRAP_CONFIG_PATH
    )
}

fn parse_args() -> Result<BootstrapCliOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();

    let mut options = BootstrapCliOptions {
        config_path: PathBuf::from(DEFAULT_BOOTSTRAP_CONFIG_PATH),
        force: false,
        non_interactive: false,
        skip_shared_edits_check: false,
        rolling_upgrade: false,
    };

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                return Err(usage());
            }
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = PathBuf::from(value);
            }
            "--force" => {
                options.force = true;
            }
            "--non-interactive" => {
                options.non_interactive = true;
            }
            "--skip-shared-edits-check" => {
                options.skip_shared_edits_check = true;
            }
            "--rolling-upgrade" => {
                options.rolling_upgrade = true;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(options)
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("create runtime failed: {}", err);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run_bootstrap(options));
    std::process::exit(code);
}
