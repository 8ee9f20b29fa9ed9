use std::io::{self, Write};

use crate::power::PowerReading;
use crate::topology::PowerTopology;

/// Number of terminal lines one rendering of `topology` occupies
pub fn display_height(topology: &PowerTopology) -> usize {
	let channel_rows = topology.channels().len().div_ceil(2);
	let residency_rows = topology.entities().len();
	let header_count = 1 + usize::from(residency_rows > 0);
	header_count + channel_rows + residency_rows
}

/// Displays power readings in the terminal with ANSI formatting
pub fn display_power_readings(reading: &PowerReading, topology: &PowerTopology) -> io::Result<()> {
	let mut out = io::stdout().lock();
	write!(out, "\x1B[{}A", display_height(topology))?; // Move cursor up

	write!(out, "\x1B[2K")?; // Clear line
	writeln!(
		out,
		"Measured Total: {:6.2} W {}",
		reading.total_watts(),
		if reading.stale { "(Stale)" } else { "" }
	)?;

	let channels: Vec<String> = topology
		.channels()
		.iter()
		.map(|channel| {
			match reading.channels.iter().find(|power| power.channel == channel.id) {
				Some(power) => format!("{:<16} {:6.2} W", channel.name, power.watts),
				None => format!("{:<16}   --   W", channel.name),
			}
		})
		.collect();
	for pair in channels.chunks(2) {
		write!(out, "\x1B[2K")?;
		match pair {
			[left, right] => writeln!(out, "{left} | {right}")?,
			[left] => writeln!(out, "{left}")?,
			_ => {},
		}
	}

	if topology.entities().is_empty() {
		return out.flush();
	}

	write!(out, "\x1B[2K")?;
	writeln!(out, "Idle Residency:")?;
	for entity in topology.entities() {
		let states: Vec<String> = entity
			.states
			.iter()
			.map(|state| {
				let share = reading
					.residency
					.iter()
					.find(|share| share.entity == entity.id && share.state == state.id)
					.map_or(0.0, |share| share.share * 100.0);
				format!("{} {:5.1}%", state.name, share)
			})
			.collect();
		write!(out, "\x1B[2K")?;
		writeln!(out, "{:<6} {}", entity.name, states.join(" | "))?;
	}

	out.flush()
}

/// Print empty lines to prepare for display
pub fn prepare_display_area(topology: &PowerTopology) -> io::Result<()> {
	let mut out = io::stdout().lock();
	for _ in 0..display_height(topology) {
		writeln!(out)?;
	}
	out.flush()
}
