/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file in TOML format
    #[arg(long, default_value_t = String::from("./config.toml"))]
    pub config_path: String,

    /// Path to the disk image
    #[arg(short, long, default_value_t = String::from("./disk.img"))]
    pub disk: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Clone, Subcommand)]
#[clap(rename_all = "kebab_case")]
pub enum Command {
    /// Create a fresh disk image and format the file system on it
    Format,
    /// Copy a host file into the simulated file system
    Copy {
        /// Host file to read
        #[arg(short, long)]
        from: String,
        /// Destination path inside the simulated file system
        #[arg(short, long)]
        to: String,
    },
    /// Print a file to stdout
    Print {
        /// File to print
        path: String,
    },
    /// List the contents of a directory
    List {
        /// Directory to list
        #[arg(default_value_t = String::from("/"))]
        path: String,
    },
    /// Create a directory
    Mkdir {
        /// Directory to create
        path: String,
    },
    /// Remove a file
    Remove {
        /// File to remove
        path: String,
    },
    /// Remove an empty directory
    Rmdir {
        /// Directory to remove
        path: String,
    },
    /// Run the file-system consistency check
    Check,
    /// Execute a user program
    Exec {
        /// Program to run
        path: String,
        /// Arguments passed to the program
        args: Vec<String>,
        /// Do not wait for the process to exit
        #[arg(short, long, default_value_t = false)]
        parallel: bool,
    },
}
