/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use args::{Args, Command};
use clap::Parser;
use config::Config;
use kernel::Kernel;
use log::{error, info};
use machine::console::Console;
use machine::disk::Disk;
use machine::machine::NoCpu;

mod args;
mod config;
mod devices;
mod fs;
mod kernel;
mod machine;
mod stats;
mod sync;
mod threads;
mod userprog;
mod vm;

fn main() {
    let status = run();
    if let Err(ref err) = status {
        error!("{:?}", err);
        eprintln!("error: {:?}", err);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    log4rs::init_file("log4rs.yml", Default::default())
        .with_context(|| "failed to init logger")?;

    let config = std::fs::read_to_string(&args.config_path)
        .with_context(|| "failed to read configuration file")?;
    let config: Config =
        toml::from_str(&config).with_context(|| "failed to parse configuration file")?;

    let disk_path = Path::new(&args.disk);
    let format = args.command == Command::Format;
    if format {
        Disk::create_image(disk_path)?;
    }

    let source = Console::source_from_path(config.console.input.as_deref())?;
    let sink = Console::sink_from_path(config.console.output.as_deref())?;
    let kernel = Kernel::create(config, disk_path, source, sink, Arc::new(NoCpu))?;

    let command = args.command.clone();
    kernel.run(move |k| -> anyhow::Result<()> {
        k.file_system
            .initialize(k, format)
            .with_context(|| "failed to bring up the file system")?;
        dispatch(k, command)
    })?;

    info!("{}", kernel.stats.report());
    Ok(())
}

fn dispatch(kernel: &Arc<Kernel>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Format => {
            info!("disk formatted");
            Ok(())
        }
        Command::Copy { from, to } => copy_in(kernel, &from, &to),
        Command::Print { path } => print_file(kernel, &path),
        Command::List { path } => {
            for name in kernel.file_system.list_directory_contents(kernel, &path)? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Mkdir { path } => Ok(kernel.file_system.create_directory(kernel, &path)?),
        Command::Remove { path } => Ok(kernel.file_system.remove_file(kernel, &path)?),
        Command::Rmdir { path } => Ok(kernel.file_system.remove_directory(kernel, &path)?),
        Command::Check => {
            anyhow::ensure!(
                kernel.file_system.check(kernel)?,
                "file system is inconsistent, see the log"
            );
            println!("file system is consistent");
            Ok(())
        }
        Command::Exec {
            path,
            args,
            parallel,
        } => {
            let pid = userprog::process::exec(kernel, &path, args, parallel)?;
            println!("pid {}", pid);
            Ok(())
        }
    }
}

fn copy_in(kernel: &Arc<Kernel>, from: &str, to: &str) -> anyhow::Result<()> {
    let mut data = Vec::new();
    std::fs::File::open(from)
        .with_context(|| format!("failed to open host file '{}'", from))?
        .read_to_end(&mut data)
        .with_context(|| format!("failed to read host file '{}'", from))?;
    kernel.file_system.create_file(kernel, to, data.len())?;
    let file = kernel.file_system.open(kernel, to)?;
    file.write_at(kernel, &data, 0)?;
    kernel.file_system.close(kernel, file)?;
    info!("copied '{}' -> '{}' ({} bytes)", from, to, data.len());
    Ok(())
}

fn print_file(kernel: &Arc<Kernel>, path: &str) -> anyhow::Result<()> {
    let mut file = kernel.file_system.open(kernel, path)?;
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 512];
    loop {
        let n = file.read(kernel, &mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
    }
    kernel.file_system.close(kernel, file)?;
    Ok(())
}
