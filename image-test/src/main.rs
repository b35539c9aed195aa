// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use log::{debug, info};
use std::{env, fs, path::PathBuf};

use images::file::FileStore;
use provisioning::{progress::format_size, Config, CreateRequest, Provisioner};

/// Name of the demo image created in the pool
const IMAGE_NAME: &str = "hello.world";

/// Loads the configuration named on the command line, or the defaults
fn load_config(path: Option<String>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Ok(Config::new_for_path(path)?)
        }
        None => {
            debug!("No configuration given, using defaults");
            Ok(Config::default())
        }
    }
}

/// Demonstrates usage of the provisioning APIs:
/// - Opening a directory backed image pool
/// - Creating a thin image
/// - Thick provisioning it with progress reporting
///
/// Usage: `image-test [POOL_DIR] [CONFIG.kdl]`
fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    info!("Starting image provisioning demo");

    let mut args = env::args().skip(1);
    let pool = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("pool"));
    let config = load_config(args.next())?;

    fs::create_dir_all(&pool)?;
    let store = FileStore::open(&pool)?;
    info!("Using image pool at {}", store.root().display());

    let provisioner = Provisioner::new(store).with_config(config);
    let image_size = 64 * 1024 * 1024;
    info!("Creating {} thick image {IMAGE_NAME}", format_size(image_size));
    provisioner.provision(&CreateRequest::new(IMAGE_NAME, image_size).thick(true))?;

    let image = provisioner.store().info(IMAGE_NAME)?;
    info!("Image information:");
    info!("  ├─Size: {}", format_size(image.size));
    if let Some(object_size) = image.options.object_size() {
        info!("  ├─Object size: {}", format_size(object_size));
    }
    info!("  └─Features: {}", image.options.features);

    // Clean up resources
    info!("Cleaning up resources");
    fs::remove_file(provisioner.store().data_path(IMAGE_NAME))?;
    fs::remove_file(provisioner.store().metadata_path(IMAGE_NAME))?;

    info!("Demo completed successfully");
    Ok(())
}
