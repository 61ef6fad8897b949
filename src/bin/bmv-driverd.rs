// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Standalone driver process: loads `app-config.json`, opens the serial link, and keeps the
//! engine alive for the life of the process.

use bmv_driver::facade::Driver;
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "bmv-driverd", about = "Victron-style battery monitor host driver.")]
struct CliOptions {
    /// Path to the JSON configuration file.
    #[structopt(long, parse(from_os_str), default_value = "app-config.json")]
    config: PathBuf,

    /// Verbosity: repeat for more detail (-v, -vv, -vvv).
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn main() {
    let opts = CliOptions::from_args();

    let level = match opts.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    async_std::task::block_on(async_main(opts));
}

async fn async_main(opts: CliOptions) {
    let driver = match Driver::start(&opts.config).await {
        Ok(driver) => driver,
        Err(e) => {
            log::error!("failed to start driver: {}", e);
            process::exit(1);
        }
    };

    log::info!("driver started, config {:?}", opts.config);

    // The engine task runs independently in the background; this task just has to stay alive.
    // SIGINT/SIGTERM handling is left to the process supervisor (systemd, docker, ...), matching
    // the "no reconnection policy beyond simple open-on-start" non-goal.
    let _ = driver.ping().await;
    std::future::pending::<()>().await;
}
