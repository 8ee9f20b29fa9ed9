use msru::{Accessor, Msr};
use std::io;

use crate::constants::RAPL_COUNTER_WIDTH_BITS;

// Raw 64-bit register read through /dev/cpu/N/msr
fn read_msr(msr_address: u32, cpu_id: usize) -> io::Result<u64> {
	let cpu = u16::try_from(cpu_id).map_err(io::Error::other)?;
	Msr::new(msr_address, cpu).map_err(io::Error::other)?.read().map_err(io::Error::other)
}

/// Reads a RAPL energy status register, keeping only the counter bits
pub fn read_energy_status(msr_address: u32, cpu_id: usize) -> io::Result<u64> {
	let mask = (1u64 << RAPL_COUNTER_WIDTH_BITS) - 1;
	Ok(read_msr(msr_address, cpu_id)? & mask)
}

/// Reads the energy status unit exponent: one counter tick is 1 / 2^unit joules
pub fn read_energy_unit(unit_msr_address: u32) -> io::Result<u32> {
	let unit_msr = read_msr(unit_msr_address, 0)?;
	Ok(((unit_msr >> 8) & 0x1F) as u32)
}
