//! Intel HEX inspection for the CC2538 bootloader backdoor.
//!
//! A mote can only be re-flashed over the serial bootloader if the image keeps
//! the backdoor enabled in the lock-bit page. The configuration byte lives at
//! `0x0027FFD4`, so the image must select the `0x0027` upper address with an
//! extended linear address record and later carry a data record at `0xFFD4`
//! whose 32-bit field ends in `0xF6`: backdoor and bootloader enabled, active
//! low, on pin PA6.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const EXTENDED_LINEAR_ADDRESS_0027: &str = ":020000040027D3";
const BACKDOOR_ADDRESS: &str = "FFD4";
const BACKDOOR_FIELD: &str = "FFFFFFF6";

pub fn is_flashable(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    scan_backdoor(BufReader::new(file))
}

pub fn scan_backdoor<R: BufRead>(reader: R) -> io::Result<bool> {
    let mut extended_linear_address_found = false;
    for line in reader.lines() {
        let line = line?;
        if line.starts_with(EXTENDED_LINEAR_ADDRESS_0027) {
            extended_linear_address_found = true;
        }
        if extended_linear_address_found && is_backdoor_record(&line) {
            return Ok(true);
        }
    }
    Ok(false)
}

// | 1:3 byte count | 3:7 address | 9:17 lock bit page field |
fn is_backdoor_record(line: &str) -> bool {
    let byte_count = line
        .get(1..3)
        .and_then(|c| u8::from_str_radix(c, 16).ok())
        .unwrap_or(0);
    line.get(3..7) == Some(BACKDOOR_ADDRESS)
        && byte_count > 4
        && line.get(9..17) == Some(BACKDOOR_FIELD)
}
