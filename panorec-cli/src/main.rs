//! Reconstruct a recorded feature stream into per-batch point clouds and trajectories.

use clap::*;
use log::*;
use panorec::prelude::v1::{Result, *};
use std::fs::File;
use std::io::BufReader;

mod export;

use export::DirectoryExporter;

fn settings(matches: &ArgMatches) -> Result<Settings> {
    let mut settings = match matches.value_of("config") {
        Some(path) => {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader(reader)?
        }
        None => Settings::default(),
    };

    if let Some(group) = matches.value_of("group") {
        settings = settings.group(group.parse()?);
    }

    if let Some(match_range) = matches.value_of("match-range") {
        settings = settings.match_range(match_range.parse()?);
    }

    if let Some(tolerance) = matches.value_of("tolerance") {
        settings = settings.tolerance(tolerance.parse()?);
    }

    if matches.is_present("mass") {
        settings = settings.mass(true);
    }

    settings.validate()?;

    Ok(settings)
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("panorec")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::new("group")
                .long("group")
                .short('g')
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::new("match-range")
                .long("match-range")
                .short('m')
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::new("tolerance")
                .long("tolerance")
                .short('t')
                .takes_value(true)
                .required(false),
        )
        .arg(Arg::new("mass").long("mass").required(false))
        .arg(Arg::new("output").takes_value(true).required(true))
        .get_matches();

    let input = matches
        .value_of("input")
        .ok_or_else(|| anyhow!("Please supply an input stream!"))?;
    let output = matches
        .value_of("output")
        .ok_or_else(|| anyhow!("Please supply an output directory!"))?;

    let settings = settings(&matches)?;

    info!("Settings: {:?}", settings);

    let mut source = panorec_loader::create_source(input)?;
    let mut exporter = DirectoryExporter::new(output)?;

    let mut reconstruction = Reconstruction::new(settings)?;
    let batches = reconstruction.run(&mut *source, &mut exporter)?;

    info!(
        "Processed {} batches: {} viewpoints, {} structures",
        batches,
        reconstruction.viewpoints().len(),
        reconstruction.model().active_structures()
    );

    Ok(())
}
