//! deckbridge: convert a Traktor collection to Pioneer CDJ/USB exports
//!
//! Exit codes: 0 success, 1 invalid arguments, 2 input unreadable,
//! 3 input unparseable, 4 output not writable, 5 cancelled, 6 internal
//! error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use deckbridge_core::track::Tier;
use deckbridge_core::validate::{summarize, validate_analysis, validate_database};
use deckbridge_engine::{
    convert, parse_collection, progress_channel, CancelFlag, ConversionOptions, Error,
    ExportFormat, KeyNotation, ParseOptions, Terminal,
};

#[derive(Parser)]
#[command(name = "deckbridge")]
#[command(about = "Traktor to Pioneer CDJ/USB converter", version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a collection into the chosen export format
    Convert {
        /// Path to the Traktor collection (.nml)
        source: PathBuf,

        /// Output directory (or .xml file for interchange-xml)
        output: PathBuf,

        /// Export target
        #[arg(long, value_enum, default_value_t = FormatArg::CdjHardware)]
        format: FormatArg,

        /// Hardware tier (controls analysis-file variants and hot cues)
        #[arg(long, value_enum, default_value_t = TierArg::TierB)]
        tier: TierArg,

        /// Music root for repairing relocated file paths
        #[arg(long)]
        music_root: Option<PathBuf>,

        /// Copy audio files into Contents/
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        copy_audio: bool,

        /// Verify copied audio with SHA-256
        #[arg(long)]
        verify_copy: bool,

        /// Key notation for the interchange Tonality attribute
        #[arg(long, value_enum, default_value_t = NotationArg::OpenKey)]
        key_notation: NotationArg,

        /// Clear a non-empty PIONEER/ tree before exporting
        #[arg(long)]
        overwrite: bool,

        /// Print the conversion report as JSON
        #[arg(long)]
        report_json: bool,
    },

    /// Validate an emitted database (.pdb/.edb) or analysis file
    Validate {
        /// File to check
        file: PathBuf,
    },

    /// Show key translations and harmonic-mixing relationships
    Keys {
        /// Open-Key token (e.g. 8A) or numeric key index (0-23)
        key: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    CdjHardware,
    InterchangeXml,
    M3u,
    DatabaseSoftware,
}

impl From<FormatArg> for ExportFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::CdjHardware => ExportFormat::CdjHardware,
            FormatArg::InterchangeXml => ExportFormat::InterchangeXml,
            FormatArg::M3u => ExportFormat::M3u,
            FormatArg::DatabaseSoftware => ExportFormat::DatabaseSoftware,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    TierA,
    TierB,
    TierC,
}

impl From<TierArg> for Tier {
    fn from(t: TierArg) -> Self {
        match t {
            TierArg::TierA => Tier::A,
            TierArg::TierB => Tier::B,
            TierArg::TierC => Tier::C,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NotationArg {
    OpenKey,
    Classical,
    FlatClassical,
}

impl From<NotationArg> for KeyNotation {
    fn from(n: NotationArg) -> Self {
        match n {
            NotationArg::OpenKey => KeyNotation::OpenKey,
            NotationArg::Classical => KeyNotation::Classical,
            NotationArg::FlatClassical => KeyNotation::FlatClassical,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not argument errors.
            if e.use_stderr() {
                eprintln!("{e}");
                return ExitCode::from(1);
            }
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging setup failed");
    }

    match cli.command {
        Command::Convert {
            source,
            output,
            format,
            tier,
            music_root,
            copy_audio,
            verify_copy,
            key_notation,
            overwrite,
            report_json,
        } => run_convert(
            source,
            output,
            ConversionOptions {
                format: format.into(),
                tier: tier.into(),
                copy_audio,
                verify_copy,
                key_notation: key_notation.into(),
                overwrite,
                selection: None,
            },
            music_root,
            report_json,
        ),
        Command::Validate { file } => run_validate(file),
        Command::Keys { key } => run_keys(&key),
    }
}

fn run_convert(
    source: PathBuf,
    output: PathBuf,
    options: ConversionOptions,
    music_root: Option<PathBuf>,
    report_json: bool,
) -> ExitCode {
    let (sink, stream) = progress_channel();
    let cancel = CancelFlag::new();

    // Drain progress on a side thread so the conversion never blocks on a
    // slow terminal.
    let printer = std::thread::spawn(move || loop {
        match stream
            .terminal
            .recv_timeout(std::time::Duration::from_millis(50))
        {
            Ok(terminal) => {
                while let Ok(event) = stream.events.try_recv() {
                    eprintln!("[{:3}%] {}", event.percent, event.message);
                }
                if let Terminal::Error(msg) = &terminal {
                    eprintln!("error: {msg}");
                }
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                while let Ok(event) = stream.events.try_recv() {
                    eprintln!("[{:3}%] {}", event.percent, event.message);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    });

    let parse_options = ParseOptions { music_root };
    let collection = match parse_collection(&source, &parse_options, Some(&sink)) {
        Ok(c) => c,
        Err(e) => {
            sink.finish(Terminal::Error(e.to_string()));
            let _ = printer.join();
            return exit_for(&e);
        }
    };

    match convert(&collection, &options, &output, Some(&sink), &cancel) {
        Ok(report) => {
            let _ = printer.join();
            if report_json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("report serialization failed: {e}"),
                }
            } else {
                println!(
                    "Exported {} tracks, {} playlists ({} analysis files, {} audio copied)",
                    report.tracks_exported,
                    report.playlists_exported,
                    report.analysis_files,
                    report.audio_copied
                );
                for issue in &report.issues {
                    println!("  warning: {issue}");
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            let _ = printer.join();
            eprintln!("conversion failed: {e}");
            exit_for(&e)
        }
    }
}

fn run_validate(file: PathBuf) -> ExitCode {
    let data = match std::fs::read(&file) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("cannot read {}: {e}", file.display());
            return ExitCode::from(2);
        }
    };

    let report = if data.starts_with(b"PMAI") {
        validate_analysis(&data)
    } else {
        validate_database(&data)
    };

    print!("{}", summarize(&report));
    if report.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn run_keys(key: &str) -> ExitCode {
    use deckbridge_core::keys::{KeyFormat, KeyTranslator, ProgressionDirection};

    let translator = KeyTranslator::new();
    let index = match key.parse::<u32>() {
        Ok(idx) => idx,
        Err(_) => match translator.index_of(key, KeyFormat::OpenKey) {
            Some(idx) => idx,
            None => {
                eprintln!("not a key index or Open-Key token: {key}");
                return ExitCode::from(1);
            }
        },
    };

    let open = match translator.to(index, KeyFormat::OpenKey) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    println!("index:          {index}");
    println!("open-key:       {open}");
    println!(
        "classical:      {}",
        translator.to(index, KeyFormat::Classical).unwrap_or("")
    );
    println!(
        "flat-classical: {}",
        translator.to(index, KeyFormat::FlatClassical).unwrap_or("")
    );
    println!(
        "vendor wheel:   {}",
        translator.to(index, KeyFormat::VendorWheel).unwrap_or("")
    );
    println!("vendor db id:   {}", translator.vendor_db_id(index));
    if let Some((r, g, b)) = translator.wheel_colour(open) {
        println!("wheel colour:   #{r:02X}{g:02X}{b:02X}");
    }

    if let Ok(n) = translator.harmonic_neighbours(open) {
        println!("perfect:        {}", n.perfect_matches.join(", "));
        println!("energy up:      {}", n.energy_up.join(", "));
        println!("energy down:    {}", n.energy_down.join(", "));
        println!("harmonic:       {}", n.harmonic_matches.join(", "));
        println!("dominant:       {}", n.dominant_matches.join(", "));
        println!("relative:       {}", n.relative_key);
    }
    if let Ok(p) = translator.progression(open, ProgressionDirection::Up) {
        println!("progression up: {}", p.join(" -> "));
    }

    ExitCode::SUCCESS
}

fn exit_for(error: &Error) -> ExitCode {
    let code = match error {
        Error::SourceUnreadable(_) => 2,
        Error::SourceUnparseable(_) => 3,
        Error::OutputNotWritable(_) => 4,
        Error::Cancelled => 5,
        _ => 6,
    };
    ExitCode::from(code)
}
