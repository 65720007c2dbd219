pub mod eeprom;
pub mod host;
pub mod otp;
pub mod sign;
