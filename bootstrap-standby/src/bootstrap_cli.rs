use log::{error, info};
use std::io::Write;
use std::path::PathBuf;

use metanode_lib::{
    exit_code, ActiveNodeClient, BootstrapConfig, BootstrapOptions, BootstrapStandby,
    FileSharedLogStore, HttpNodeClient, NodeStorage, ReformatConfirm, EXIT_FAILURE,
};

pub const DEFAULT_BOOTSTRAP_CONFIG_PATH: &str = "/opt/metanode/etc/bootstrap.json";

#[derive(Debug, Clone)]
pub struct BootstrapCliOptions {
    pub config_path: PathBuf,
    pub force: bool,
    pub non_interactive: bool,
    pub skip_shared_edits_check: bool,
    pub rolling_upgrade: bool,
}

/// Prompts the operator on the controlling terminal before wiping
/// already formatted storage.
pub struct StdinConfirm;

impl ReformatConfirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        loop {
            print!("{} (Y or N) ", prompt);
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => return true,
                "n" | "no" => return false,
                other => println!("Invalid input: {}", other),
            }
        }
    }
}

pub async fn run_bootstrap(options: BootstrapCliOptions) -> i32 {
    let config = match BootstrapConfig::load_from_file(&options.config_path).await {
        Ok(config) => config,
        Err(err) => {
            error!(
                "load bootstrap config {} failed: {}",
                options.config_path.display(),
                err
            );
            return EXIT_FAILURE;
        }
    };

    let storage = match NodeStorage::new(config.image_dirs.clone()) {
        Ok(storage) => storage,
        Err(err) => {
            error!("invalid storage configuration: {}", err);
            return EXIT_FAILURE;
        }
    };
    let log_store = FileSharedLogStore::new(config.shared_edits_dir.clone());

    let mut clients = Vec::new();
    for address in &config.remote_nodes {
        match HttpNodeClient::new(address) {
            Ok(client) => clients.push(client),
            Err(err) => {
                error!("create client for {} failed: {}", address, err);
                return EXIT_FAILURE;
            }
        }
    }
    let remotes: Vec<&dyn ActiveNodeClient> = clients
        .iter()
        .map(|c| c as &dyn ActiveNodeClient)
        .collect();

    let bootstrap_options = BootstrapOptions {
        force: options.force,
        interactive: !options.non_interactive,
        skip_shared_edits_check: options.skip_shared_edits_check,
        rolling_upgrade: options.rolling_upgrade,
    };
    let confirm = StdinConfirm;
    let bootstrap = BootstrapStandby::new(
        remotes,
        &log_store,
        &storage,
        &config,
        &confirm,
        bootstrap_options,
    );

    let result = bootstrap.run().await;
    match &result {
        Ok(()) => info!("standby bootstrap finished"),
        Err(err) => error!("standby bootstrap failed: {}", err),
    }
    exit_code(&result)
}
