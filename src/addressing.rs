//! Substrate and device addressing.
//!
//! Maps logical holder coordinates onto the physical numbering used by the
//! stage and the switch matrix. Two fixed schemes live here:
//!
//! - **Substrate numbering**: the holder is traversed column-major in a
//!   serpentine layout, `number = R*(C - col) - row` for an R×C grid with
//!   0-indexed `(row, col)`. For the default 4×4 holder this is
//!   `4*(4 - col) - row`. The mapping is a bijection between grid positions
//!   and the physical numbers `1..=R*C`; stage motion targets and the switch
//!   netlist both depend on it, so the formula must not change.
//! - **Device-to-channel mapping**: each substrate carries six devices whose
//!   pad order on the PCB differs from the logical device order. The
//!   permutation is wiring-dependent and therefore loaded from the
//!   connection map in configuration rather than hard-coded.
//!
//! Everything here is pure computation; out-of-range coordinates are
//! rejected with [`SequencerError::Addressing`] before any hardware call.

use crate::error::SequencerError;
use serde::{Deserialize, Serialize};

/// Number of devices patterned on every substrate.
pub const DEVICES_PER_SUBSTRATE: usize = 6;

fn default_active() -> bool {
    true
}

/// One position in the substrate holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateSlot {
    /// Operator-assigned substrate label; `None` means the slot is empty.
    #[serde(default)]
    pub label: Option<String>,
    /// Disabled slots are skipped during acquisition (e.g. broken contact).
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Default for SubstrateSlot {
    fn default() -> Self {
        Self {
            label: None,
            active: true,
        }
    }
}

impl SubstrateSlot {
    /// Whether the sequencer should measure this slot.
    pub fn is_measurable(&self) -> bool {
        self.active && self.label.is_some()
    }
}

/// Fixed R×C matrix of substrate slots.
///
/// Row-major storage; all coordinate access is bounds-checked and returns
/// [`SequencerError::Addressing`] on violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateGrid {
    rows: usize,
    cols: usize,
    slots: Vec<SubstrateSlot>,
}

impl SubstrateGrid {
    /// Create an empty grid of the given dimensions.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            slots: vec![SubstrateSlot::default(); rows * cols],
        }
    }

    /// Grid row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Grid column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of physical substrate positions.
    pub fn substrate_count(&self) -> usize {
        self.rows * self.cols
    }

    fn index(&self, row: usize, col: usize) -> Result<usize, SequencerError> {
        if row >= self.rows || col >= self.cols {
            return Err(SequencerError::Addressing(format!(
                "position ({row}, {col}) outside {}x{} grid",
                self.rows, self.cols
            )));
        }
        Ok(row * self.cols + col)
    }

    /// Slot at `(row, col)`.
    pub fn slot(&self, row: usize, col: usize) -> Result<&SubstrateSlot, SequencerError> {
        let idx = self.index(row, col)?;
        Ok(&self.slots[idx])
    }

    /// Assign or clear a slot's substrate label.
    pub fn set_label(
        &mut self,
        row: usize,
        col: usize,
        label: Option<String>,
    ) -> Result<(), SequencerError> {
        let idx = self.index(row, col)?;
        self.slots[idx].label = label;
        Ok(())
    }

    /// Enable or disable a slot.
    pub fn set_active(&mut self, row: usize, col: usize, active: bool) -> Result<(), SequencerError> {
        let idx = self.index(row, col)?;
        self.slots[idx].active = active;
        Ok(())
    }

    /// Physical substrate number for a grid position.
    ///
    /// Serpentine column-major: `R*(C - col) - row`, 0-indexed inputs,
    /// 1-based output covering exactly `1..=R*C`.
    pub fn substrate_number(&self, row: usize, col: usize) -> Result<u32, SequencerError> {
        self.index(row, col)?;
        Ok((self.rows * (self.cols - col) - row) as u32)
    }

    /// Grid positions in ascending physical substrate number order.
    ///
    /// This is the traversal order of the acquisition loop.
    pub fn iter_physical_order(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.cols)
            .rev()
            .flat_map(move |col| (0..self.rows).rev().map(move |row| (row, col)))
    }
}

/// Physical switch-matrix channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

fn default_device_to_pin() -> [usize; DEVICES_PER_SUBSTRATE] {
    [3, 2, 1, 4, 5, 6]
}

fn default_channels_per_substrate() -> u32 {
    DEVICES_PER_SUBSTRATE as u32
}

/// Wiring-dependent device-to-channel mapping.
///
/// `device_to_pin` is the permutation from logical device index (1..=6) to
/// the PCB pad index; the physical channel composes that with a
/// per-substrate block offset. Loaded from the connection map section of the
/// settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMap {
    /// Logical device index to PCB pad index, 1-based on both sides.
    #[serde(default = "default_device_to_pin")]
    pub device_to_pin: [usize; DEVICES_PER_SUBSTRATE],
    /// Channel block size reserved per substrate on the matrix.
    #[serde(default = "default_channels_per_substrate")]
    pub channels_per_substrate: u32,
}

impl Default for ConnectionMap {
    fn default() -> Self {
        Self {
            device_to_pin: default_device_to_pin(),
            channels_per_substrate: default_channels_per_substrate(),
        }
    }
}

impl ConnectionMap {
    /// Check that `device_to_pin` is a permutation of `1..=6` and the block
    /// size can hold it.
    pub fn validate(&self) -> Result<(), SequencerError> {
        let mut seen = [false; DEVICES_PER_SUBSTRATE];
        for &pin in &self.device_to_pin {
            if pin == 0 || pin > DEVICES_PER_SUBSTRATE {
                return Err(SequencerError::Configuration(format!(
                    "connection map pin {pin} outside 1..={DEVICES_PER_SUBSTRATE}"
                )));
            }
            if seen[pin - 1] {
                return Err(SequencerError::Configuration(format!(
                    "connection map repeats pin {pin}"
                )));
            }
            seen[pin - 1] = true;
        }
        if (self.channels_per_substrate as usize) < DEVICES_PER_SUBSTRATE {
            return Err(SequencerError::Configuration(format!(
                "channels_per_substrate {} cannot hold {DEVICES_PER_SUBSTRATE} devices",
                self.channels_per_substrate
            )));
        }
        Ok(())
    }

    /// Physical switch-matrix channel for a device on a substrate.
    ///
    /// `substrate_number` is 1-based (from [`SubstrateGrid::substrate_number`]),
    /// `device_index` is 1..=6.
    pub fn physical_channel(
        &self,
        substrate_number: u32,
        device_index: usize,
    ) -> Result<ChannelId, SequencerError> {
        if substrate_number == 0 {
            return Err(SequencerError::Addressing(
                "substrate number 0 is not a physical position".into(),
            ));
        }
        if device_index == 0 || device_index > DEVICES_PER_SUBSTRATE {
            return Err(SequencerError::Addressing(format!(
                "device index {device_index} outside 1..={DEVICES_PER_SUBSTRATE}"
            )));
        }
        let pin = self.device_to_pin[device_index - 1] as u32;
        Ok(ChannelId(
            (substrate_number - 1) * self.channels_per_substrate + pin,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_substrate_number_matches_serpentine_form() {
        // Reference points of the fixed 4x4 scheme: 4*(4-col) - row.
        let grid = SubstrateGrid::new(4, 4);
        assert_eq!(grid.substrate_number(0, 0).unwrap(), 16);
        assert_eq!(grid.substrate_number(3, 0).unwrap(), 13);
        assert_eq!(grid.substrate_number(0, 3).unwrap(), 4);
        assert_eq!(grid.substrate_number(3, 3).unwrap(), 1);
        assert_eq!(grid.substrate_number(1, 2).unwrap(), 7);
    }

    #[test]
    fn test_substrate_number_is_bijection() {
        let grid = SubstrateGrid::new(4, 4);
        let mut seen = HashSet::new();
        for row in 0..4 {
            for col in 0..4 {
                let n = grid.substrate_number(row, col).unwrap();
                assert!((1..=16).contains(&n), "substrate {n} out of range");
                assert!(seen.insert(n), "substrate {n} produced twice");
            }
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_bijection_on_non_square_grid() {
        let grid = SubstrateGrid::new(3, 5);
        let mut seen = HashSet::new();
        for row in 0..3 {
            for col in 0..5 {
                seen.insert(grid.substrate_number(row, col).unwrap());
            }
        }
        assert_eq!(seen, (1..=15).collect::<HashSet<u32>>());
    }

    #[test]
    fn test_physical_order_is_ascending() {
        let grid = SubstrateGrid::new(4, 4);
        let numbers: Vec<u32> = grid
            .iter_physical_order()
            .map(|(row, col)| grid.substrate_number(row, col).unwrap())
            .collect();
        assert_eq!(numbers, (1..=16).collect::<Vec<u32>>());
    }

    #[test]
    fn test_out_of_range_is_addressing_error() {
        let grid = SubstrateGrid::new(4, 4);
        assert!(matches!(
            grid.substrate_number(4, 0),
            Err(SequencerError::Addressing(_))
        ));
        assert!(matches!(
            grid.substrate_number(0, 4),
            Err(SequencerError::Addressing(_))
        ));
    }

    #[test]
    fn test_slot_editing() {
        let mut grid = SubstrateGrid::new(4, 4);
        grid.set_label(1, 2, Some("batch7-s3".into())).unwrap();
        grid.set_active(1, 2, false).unwrap();
        let slot = grid.slot(1, 2).unwrap();
        assert_eq!(slot.label.as_deref(), Some("batch7-s3"));
        assert!(!slot.is_measurable());
        assert!(grid.set_label(9, 0, None).is_err());
    }

    #[test]
    fn test_channel_composition() {
        let map = ConnectionMap::default();
        // Substrate 1 occupies channels 1..=6; device 1 lands on pad 3.
        assert_eq!(map.physical_channel(1, 1).unwrap(), ChannelId(3));
        assert_eq!(map.physical_channel(1, 3).unwrap(), ChannelId(1));
        assert_eq!(map.physical_channel(1, 6).unwrap(), ChannelId(6));
        // Substrate 2 shifts by one block.
        assert_eq!(map.physical_channel(2, 1).unwrap(), ChannelId(9));
    }

    #[test]
    fn test_channel_rejects_bad_device_index() {
        let map = ConnectionMap::default();
        assert!(matches!(
            map.physical_channel(1, 0),
            Err(SequencerError::Addressing(_))
        ));
        assert!(matches!(
            map.physical_channel(1, 7),
            Err(SequencerError::Addressing(_))
        ));
    }

    #[test]
    fn test_connection_map_validation() {
        assert!(ConnectionMap::default().validate().is_ok());

        let repeated = ConnectionMap {
            device_to_pin: [3, 3, 1, 4, 5, 6],
            ..ConnectionMap::default()
        };
        assert!(matches!(
            repeated.validate(),
            Err(SequencerError::Configuration(_))
        ));

        let out_of_range = ConnectionMap {
            device_to_pin: [3, 2, 1, 4, 5, 7],
            ..ConnectionMap::default()
        };
        assert!(out_of_range.validate().is_err());
    }
}
