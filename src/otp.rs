//! One-time programmable memory access through the firmware mailbox.
//!
//! The customer signing key lives in a fixed region of eight 32 bit OTP
//! rows. Reads and writes go through the firmware's mailbox command, which
//! prints the whole property buffer back as hex words: seven words of
//! framing followed by the eight key rows.

use std::convert::TryInto;
use std::io;
use std::process::{Command, ExitStatus};

use log::{debug, info};
use thiserror::Error;

/// The mailbox command consumed for OTP access
const MAILBOX_TOOL: &str = "vcmailbox";

/// Property tag that reads the customer key rows
const TAG_GET_CUSTOMER_KEY: u32 = 0x0003_0081;

/// Property tag that programs the customer key rows
const TAG_SET_CUSTOMER_KEY: u32 = 0x0003_8081;

/// Number of framing words preceding the key rows in a mailbox response
const RESPONSE_HEADER_WORDS: usize = 7;

/// The customer key region is eight 32 bit OTP rows
pub const CUSTOMER_KEY_WORDS: usize = 8;

/// Size of the customer key region in bytes
pub const CUSTOMER_KEY_SIZE: usize = CUSTOMER_KEY_WORDS * 4;

#[derive(Error, Debug)]
pub enum OtpError {
    #[error("{} exited with {}: {}", MAILBOX_TOOL, _0, _1)]
    CommandFailed(ExitStatus, String),

    #[error("Could not parse the mailbox response: {:?}", _0)]
    MalformedResponse(String),

    #[error("The key is {} bytes - the OTP key region holds exactly {}", _0, CUSTOMER_KEY_SIZE)]
    InvalidKeySize(usize),

    #[error("The OTP write did not read back - the key region may already be programmed")]
    ReadbackMismatch,

    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
}

/// Reads the customer key region
pub fn read_customer_key() -> Result<[u8; CUSTOMER_KEY_SIZE], OtpError> {
    let words = mailbox_call(TAG_GET_CUSTOMER_KEY, &[0u32; CUSTOMER_KEY_WORDS])?;

    Ok(words_to_key(&words))
}

/// Programs the customer key region and verifies that the rows latched.
///
/// OTP rows are write-once: a mismatch on readback is fatal and usually
/// means the region was already programmed with a different key.
pub fn write_customer_key(key: &[u8]) -> Result<(), OtpError> {
    if key.len() != CUSTOMER_KEY_SIZE {
        return Err(OtpError::InvalidKeySize(key.len()));
    }

    let mut words = [0u32; CUSTOMER_KEY_WORDS];

    for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
        *word = u32::from_be_bytes(chunk.try_into().expect("4 byte chunk"));
    }

    info!("Programming the customer key region");
    mailbox_call(TAG_SET_CUSTOMER_KEY, &words)?;

    // Verify the fuses latched
    let readback = read_customer_key()?;

    if readback != key {
        return Err(OtpError::ReadbackMismatch);
    }

    Ok(())
}

/// Invokes the mailbox command with the given property tag and key words,
/// returning the key words echoed back in the response
fn mailbox_call(
    tag: u32,
    words: &[u32; CUSTOMER_KEY_WORDS],
) -> Result<[u32; CUSTOMER_KEY_WORDS], OtpError> {
    let mut command = Command::new(MAILBOX_TOOL);

    command
        .arg(format!("{:#010x}", tag))
        .arg("40")
        .arg("40")
        .arg("0")
        .arg(CUSTOMER_KEY_WORDS.to_string());

    for word in words {
        command.arg(format!("{:#010x}", word));
    }

    debug!("Invoking {} with tag {:#010x}", MAILBOX_TOOL, tag);

    let output = command.output()?;

    if !output.status.success() {
        return Err(OtpError::CommandFailed(
            output.status,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    parse_mailbox_response(&String::from_utf8_lossy(&output.stdout))
}

/// Extracts the eight key words from a mailbox response line
fn parse_mailbox_response(stdout: &str) -> Result<[u32; CUSTOMER_KEY_WORDS], OtpError> {
    let words: Vec<u32> = stdout
        .split_whitespace()
        .filter_map(|word| word.strip_prefix("0x"))
        .filter_map(|word| u32::from_str_radix(word, 16).ok())
        .collect();

    if words.len() < RESPONSE_HEADER_WORDS + CUSTOMER_KEY_WORDS {
        return Err(OtpError::MalformedResponse(stdout.trim().to_owned()));
    }

    let mut key_words = [0u32; CUSTOMER_KEY_WORDS];
    key_words.copy_from_slice(
        &words[RESPONSE_HEADER_WORDS..RESPONSE_HEADER_WORDS + CUSTOMER_KEY_WORDS],
    );

    Ok(key_words)
}

/// Serializes OTP rows to bytes, big-endian per row
fn words_to_key(words: &[u32; CUSTOMER_KEY_WORDS]) -> [u8; CUSTOMER_KEY_SIZE] {
    let mut key = [0u8; CUSTOMER_KEY_SIZE];

    for (chunk, word) in key.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }

    key
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn it_should_parse_a_mailbox_response() {
        let stdout = "0x00000040 0x80000000 0x00030081 0x00000028 0x00000028 \
                      0x00000000 0x00000008 0x11223344 0x55667788 0x99aabbcc \
                      0xddeeff00 0x01020304 0x05060708 0x090a0b0c 0x0d0e0f10";

        let words = parse_mailbox_response(stdout).unwrap();

        assert_eq!(words[0], 0x11223344);
        assert_eq!(words[7], 0x0d0e0f10);
    }

    #[test]
    fn it_should_reject_a_short_mailbox_response() {
        let result = parse_mailbox_response("0x00000040 0x80000000");

        assert!(matches!(result, Err(OtpError::MalformedResponse(_))));
    }

    #[test]
    fn it_should_serialize_rows_big_endian() {
        let words = [
            0x11223344, 0x55667788, 0x99aabbcc, 0xddeeff00, 0x01020304, 0x05060708, 0x090a0b0c,
            0x0d0e0f10,
        ];

        let key = words_to_key(&words);

        assert_eq!(
            &key[..8],
            &hex!("11 22 33 44 55 66 77 88")
        );
    }
}
