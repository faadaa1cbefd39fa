use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheArgs {
    /// Remove expired entries
    Purge {
        /// Remove every entry, expired or not
        #[clap(long, default_value = "false")]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start cratedig as a service.
    Daemon {
        /// Address to listen on. Overrides daemon.listen from config.yaml
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Identify the release shown in a photo
    Identify {
        /// Path to a JPEG, PNG, WebP or GIF image
        image: PathBuf,
    },

    /// (Re)compute fingerprints of catalog items
    Ingest {
        /// Item ids. Ingests every item with an image when omitted
        ids: Vec<u64>,
    },

    /// Add a release to the catalog and fingerprint its image
    Add {
        /// Release title
        #[clap(short, long)]
        title: String,

        /// Path to the cover image
        #[clap(short, long)]
        image: PathBuf,

        /// Artist or collection id
        #[clap(short, long)]
        parent: Option<u64>,
    },

    /// Add releases listed in a CSV file and fingerprint their covers
    Import {
        /// CSV with "Ground Truth", "Release" and "Artist" columns. Cover
        /// paths are relative to the CSV file
        csv: PathBuf,
    },

    /// Replace the image of a catalog item
    SetImage {
        id: u64,

        /// Path to the new cover image
        image: PathBuf,
    },

    /// Remove a release from the catalog
    Remove { id: u64 },

    /// Look up release metadata and compare what providers report
    Metadata {
        /// "<artist> - <album>"
        query: String,

        /// Providers to query, comma separated. All when omitted
        #[clap(short, long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
    },

    /// Manage the result cache
    #[clap(subcommand)]
    Cache(CacheArgs),
}
