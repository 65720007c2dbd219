use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use log::info;
use structopt::StructOpt;

mod cli;

use cli::{Command, ConfigCommand, ExtractOpts, GetOpts, OtpCommand, SignOpts, UpdateOpts};
use pieeprom::eeprom::{EepromImage, FileTarget, CONFIG_FILENAME};
use pieeprom::host;
use pieeprom::otp;
use pieeprom::sign::{self, Chip, ExternalSigner, LocalKeySigner, Signer};

/// Prints the boot configuration stored in `image`, or the live one reported
/// by the firmware when no image is given
fn config_read(image: Option<&Path>) -> Result<(), anyhow::Error> {
    let config = match image {
        Some(path) => {
            let image = EepromImage::from_file(path)?;
            let payload = image.get_file(&FileTarget::named(CONFIG_FILENAME))?;

            String::from_utf8_lossy(&payload).into_owned()
        }
        None => host::current_bootloader_config()?,
    };

    print!("{}", config);

    Ok(())
}

/// Writes the modified image and optionally hands it to the update tool
fn write_and_schedule(
    image: &EepromImage,
    output: &Path,
    no_schedule: bool,
) -> Result<(), anyhow::Error> {
    image.write_to_file(output)?;
    println!("Wrote {}", output.display());

    if !no_schedule && host::confirm("Schedule the EEPROM update for the next reboot?")? {
        host::schedule_update(output)?;
    }

    Ok(())
}

/// Resolves the image to operate on, falling back to the latest release image
fn source_image(image: Option<PathBuf>) -> Result<PathBuf, anyhow::Error> {
    match image {
        Some(path) => Ok(path),
        None => Ok(host::latest_eeprom_image()?),
    }
}

fn config_edit(
    image: Option<PathBuf>,
    output: &Path,
    no_schedule: bool,
) -> Result<(), anyhow::Error> {
    let source = source_image(image)?;
    let mut image = EepromImage::from_file(&source)?;
    let config = image.get_file(&FileTarget::named(CONFIG_FILENAME))?;

    // Hand the current configuration to the user's editor through a
    // temporary file that is removed again when this function returns
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile()?;

    file.write_all(&config)?;
    file.flush()?;

    host::edit_file(file.path())?;

    let edited = fs::read(file.path())?;

    if edited == config {
        println!("Configuration unchanged - nothing to do");
        return Ok(());
    }

    image.update_file(CONFIG_FILENAME, &edited)?;

    write_and_schedule(&image, output, no_schedule)
}

fn config_apply(
    config: &Path,
    image: Option<PathBuf>,
    output: &Path,
    no_schedule: bool,
) -> Result<(), anyhow::Error> {
    let text = fs::read(config)
        .with_context(|| format!("Failed to read configuration file '{}'", config.display()))?;

    let source = source_image(image)?;
    let mut image = EepromImage::from_file(&source)?;

    image.update_file(CONFIG_FILENAME, &text)?;

    write_and_schedule(&image, output, no_schedule)
}

fn get_file(opts: &GetOpts) -> Result<(), anyhow::Error> {
    let image = EepromImage::from_file(&opts.image)?;
    let payload = image.get_file(&FileTarget::named(&opts.filename))?;

    match &opts.output {
        Some(path) => fs::write(path, payload)?,
        None => io::stdout().lock().write_all(&payload)?,
    }

    Ok(())
}

fn update_file(opts: &UpdateOpts) -> Result<(), anyhow::Error> {
    let payload = fs::read(&opts.input)
        .with_context(|| format!("Failed to read input file '{}'", opts.input.display()))?;

    let mut image = EepromImage::from_file(&opts.image)?;

    match FileTarget::named(&opts.filename) {
        FileTarget::Bootcode => image.update_bootcode(&payload)?,
        FileTarget::Named(name) => image.update_file(&name, &payload)?,
    }

    let output = opts.output.as_ref().unwrap_or(&opts.image);

    image.write_to_file(output)?;
    println!("Wrote {}", output.display());

    Ok(())
}

fn extract(opts: &ExtractOpts) -> Result<(), anyhow::Error> {
    let image = EepromImage::from_file(&opts.image)?;

    fs::create_dir_all(&opts.directory)?;

    for path in image.extract_all(&opts.directory)? {
        println!("{}", path.display());
    }

    Ok(())
}

/// Reads the payload to sign from a file, or base64 encoded from stdin
fn read_payload(input: Option<&Path>) -> Result<Vec<u8>, anyhow::Error> {
    match input {
        Some(path) => fs::read(path)
            .with_context(|| format!("Failed to read payload '{}'", path.display())),
        None => {
            let mut encoded = String::new();
            io::stdin().lock().read_to_string(&mut encoded)?;

            Ok(base64::engine::general_purpose::STANDARD.decode(encoded.trim())?)
        }
    }
}

fn write_signed_image(image: &[u8], opts: &SignOpts) -> Result<(), anyhow::Error> {
    match &opts.output {
        Some(path) => {
            fs::write(path, image)?;
            info!("Wrote {} byte signed image to {:?}", image.len(), path);
        }
        None if opts.base64 => {
            println!("{}", base64::engine::general_purpose::STANDARD.encode(image));
        }
        None => io::stdout().lock().write_all(image)?,
    }

    Ok(())
}

fn sign_image(opts: &SignOpts) -> Result<(), anyhow::Error> {
    let payload = read_payload(opts.input.as_deref())?;

    let local = match &opts.key {
        Some(path) => Some(LocalKeySigner::from_pem_file(path)?),
        None => None,
    };
    let external = opts.signer.as_ref().map(ExternalSigner::new);

    let signer: &dyn Signer = match (&local, &external) {
        (Some(local), _) => local,
        (None, Some(external)) => external,
        (None, None) => anyhow::bail!("either --key or --signer is required"),
    };

    let image = match opts.chip {
        Chip::Bcm2711 => {
            let hmac_key = opts
                .hmac_key
                .as_ref()
                .context("--hmac-key is required when signing for the 2711")?;
            let hmac_key = fs::read(hmac_key)?;

            sign::sign_bcm2711(&payload, opts.key_index, signer, &hmac_key)?
        }
        Chip::Bcm2712 => {
            let public_key = match (&local, &opts.pubkey) {
                (_, Some(path)) => sign::public_key_from_pem(&fs::read_to_string(path)?)?,
                (Some(local), None) => local.public_key(),
                (None, None) => {
                    anyhow::bail!("--pubkey is required when using --signer for the 2712")
                }
            };

            sign::sign_bcm2712(&payload, opts.key_index, opts.version, signer, &public_key)?
        }
    };

    write_signed_image(&image, opts)
}

fn otp_read_key() -> Result<(), anyhow::Error> {
    let key = otp::read_customer_key()?;

    println!("{}", hex::encode(key));

    Ok(())
}

fn otp_write_key(key_file: &Path) -> Result<(), anyhow::Error> {
    let key = fs::read(key_file)
        .with_context(|| format!("Failed to read key file '{}'", key_file.display()))?;

    if !host::confirm("Programming the customer key is permanent. Continue?")? {
        println!("Aborted");
        return Ok(());
    }

    otp::write_customer_key(&key)?;
    println!("Customer key programmed and verified");

    Ok(())
}

/// Maps the `-v` occurrence count to a log filter, honoring RUST_LOG when it
/// is set
fn init_logging(verbose: u8) {
    let filters = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let mut builder = pretty_env_logger::formatted_timed_builder();

    match env::var("RUST_LOG") {
        Ok(env_filters) => builder.parse_filters(&env_filters),
        Err(_) => builder.parse_filters(filters),
    };

    builder.init();
}

fn main() -> Result<(), anyhow::Error> {
    let opts = cli::Opts::from_args();

    init_logging(opts.verbose);

    match opts.command {
        Command::Config(ConfigCommand::Read { image }) => config_read(image.as_deref())?,
        Command::Config(ConfigCommand::Edit {
            image,
            output,
            no_schedule,
        }) => config_edit(image, &output, no_schedule)?,
        Command::Config(ConfigCommand::Apply {
            config,
            image,
            output,
            no_schedule,
        }) => config_apply(&config, image, &output, no_schedule)?,
        Command::Get(opts) => get_file(&opts)?,
        Command::Update(opts) => update_file(&opts)?,
        Command::Extract(opts) => extract(&opts)?,
        Command::Sign(opts) => sign_image(&opts)?,
        Command::Otp(OtpCommand::ReadKey) => otp_read_key()?,
        Command::Otp(OtpCommand::WriteKey { key_file }) => otp_write_key(&key_file)?,
    }

    Ok(())
}
