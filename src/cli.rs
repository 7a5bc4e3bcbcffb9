use clap::{Parser, Subcommand};
use xfer::{BackendKind, DataFormat};

#[derive(Parser)]
#[command(name = "xfer", about = "Clipboard exchange over X11 selections and the Wayland data device")]
pub struct Cli {
    /// Display backend: auto, x11 or wayland
    #[arg(long, default_value = "auto")]
    pub backend: BackendKind,

    /// Give up waiting on the clipboard owner after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read stdin and serve it until another client takes the selection
    Copy {
        /// text, uri-list, image, or any MIME type
        #[arg(long, default_value = "text", value_parser = parse_format)]
        format: DataFormat,

        /// Use the primary selection instead of the clipboard
        #[arg(long)]
        primary: bool,
    },

    /// Print the current clipboard contents
    Paste {
        /// text, uri-list, image, or any MIME type
        #[arg(long, default_value = "text", value_parser = parse_format)]
        format: DataFormat,

        /// Use the primary selection instead of the clipboard
        #[arg(long)]
        primary: bool,
    },

    /// List the formats on offer
    Targets {
        /// Use the primary selection instead of the clipboard
        #[arg(long)]
        primary: bool,
    },
}

/// Short names for the standard formats; anything else is taken as a
/// peer format name.
pub fn parse_format(s: &str) -> Result<DataFormat, String> {
    match s {
        "text" => Ok(DataFormat::text()),
        "uri-list" | "uris" => Ok(DataFormat::uri_list()),
        "image" => Ok(DataFormat::image()),
        "" => Err("format name must not be empty".into()),
        other => Ok(xfer::format::standard_for(other)),
    }
}
