use std::path::PathBuf;

use structopt::StructOpt;

use pieeprom::sign::Chip;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Read, edit or apply the bootloader configuration
    Config(ConfigCommand),
    /// Print a file stored in an EEPROM image
    Get(GetOpts),
    /// Replace a file stored in an EEPROM image
    Update(UpdateOpts),
    /// Extract the bootcode and every named file from an EEPROM image
    Extract(ExtractOpts),
    /// Produce a signed second-stage bootcode image
    Sign(SignOpts),
    /// Access the customer key region in OTP memory
    Otp(OtpCommand),
}

#[derive(StructOpt, Debug)]
pub enum ConfigCommand {
    /// Print the boot configuration from an image, or the live one
    Read {
        /// EEPROM image to read from instead of the running system
        image: Option<PathBuf>,
    },
    /// Edit the boot configuration in $EDITOR and schedule the update
    Edit {
        /// EEPROM image to edit - defaults to the latest release image
        image: Option<PathBuf>,
        /// Where to write the modified image
        #[structopt(short = "o", long = "output", default_value = "pieeprom-new.bin")]
        output: PathBuf,
        /// Do not schedule the EEPROM flash after writing the image
        #[structopt(long = "no-schedule")]
        no_schedule: bool,
    },
    /// Apply a configuration file to an image
    Apply {
        /// The configuration text file to embed
        config: PathBuf,
        /// EEPROM image to apply to - defaults to the latest release image
        image: Option<PathBuf>,
        /// Where to write the modified image
        #[structopt(short = "o", long = "output", default_value = "pieeprom-new.bin")]
        output: PathBuf,
        /// Do not schedule the EEPROM flash after writing the image
        #[structopt(long = "no-schedule")]
        no_schedule: bool,
    },
}

#[derive(StructOpt, Debug)]
pub struct GetOpts {
    /// The EEPROM image to read
    pub image: PathBuf,
    /// Name of the embedded file, e.g. bootconf.txt or bootcode.bin
    pub filename: String,
    /// Write the contents to a file instead of stdout
    #[structopt(short = "o", long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub struct UpdateOpts {
    /// The EEPROM image to modify
    pub image: PathBuf,
    /// Name of the embedded file, e.g. bootconf.txt or bootcode.bin
    pub filename: String,
    /// File holding the new contents
    pub input: PathBuf,
    /// Where to write the modified image - defaults to rewriting it in place
    #[structopt(short = "o", long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub struct ExtractOpts {
    /// The EEPROM image to extract from
    pub image: PathBuf,
    /// Directory to extract into
    #[structopt(default_value = ".")]
    pub directory: PathBuf,
}

#[derive(StructOpt, Debug)]
pub struct SignOpts {
    /// Target chip family - 2711 or 2712
    #[structopt(short = "c", long = "chip")]
    pub chip: Chip,

    /// The bootcode payload - reads base64 from stdin when omitted
    #[structopt(short = "i", long = "input")]
    pub input: Option<PathBuf>,

    /// Where to write the signed image - writes to stdout when omitted
    #[structopt(short = "o", long = "output")]
    pub output: Option<PathBuf>,

    /// Base64 encode the signed image written to stdout
    #[structopt(long = "base64")]
    pub base64: bool,

    /// PEM encoded 2048 bit RSA private key
    #[structopt(short = "k", long = "key", required_unless = "signer")]
    pub key: Option<PathBuf>,

    /// External signing command, invoked as `<command> -a <algorithm> <file>`
    #[structopt(long = "signer", conflicts_with = "key")]
    pub signer: Option<PathBuf>,

    /// PEM encoded RSA public key - required with --signer for 2712
    #[structopt(short = "p", long = "pubkey")]
    pub pubkey: Option<PathBuf>,

    /// Signing key index - 0-4, or 16 for the customer key
    #[structopt(short = "n", long = "key-index", default_value = "0")]
    pub key_index: u32,

    /// Rollback version fuse value, 0-32 (2712 only)
    #[structopt(long = "version", default_value = "0")]
    pub version: u32,

    /// File holding the HMAC key for the integrity digest (2711 only)
    #[structopt(long = "hmac-key")]
    pub hmac_key: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub enum OtpCommand {
    /// Print the customer key region as hex
    ReadKey,
    /// Program the customer key region - this cannot be undone
    WriteKey {
        /// File holding the 32 byte key
        key_file: PathBuf,
    },
}

#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// Increase verbosity - may be repeated
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbose: u8,
}
