use tracing::trace;

use crate::opcode::Opcode;

/// Placeholder written into a 32-bit slot whose value is not yet known.
/// Every placeholder is tracked in a fixup table and patched before the
/// surrounding scope closes.
pub const INVALID_OFFSET: u32 = u32::MAX;

/// Sentinel for an unassigned table element.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Byte size of one br_table entry record: target:u32, drop:u32, keep:u8.
pub const BR_TABLE_ENTRY_SIZE: u32 = 9;

/// The append-only instruction stream shared by all modules in an
/// environment. Offsets are absolute; back-patching rewrites previously
/// emitted 32-bit slots in place, so the stream never moves targets.
#[derive(Debug, Default)]
pub struct Istream {
    bytes: Vec<u8>,
}

impl Istream {
    /// Current logical offset, i.e. where the next emission lands.
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn emit_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub(crate) fn emit_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn emit_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn emit_opcode(&mut self, opcode: Opcode) {
        self.emit_u8(opcode as u8);
    }

    /// Overwrite a previously emitted 32-bit slot.
    pub(crate) fn patch_u32(&mut self, offset: u32, value: u32) {
        let offset = offset as usize;
        debug_assert!(offset + 4 <= self.bytes.len(), "patch offset out of bounds");
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Collapse the operand stack to `floor + keep` values: discard `drop`
    /// values that sit below the top `keep` values. `keep` is 0 or 1.
    /// Emits nothing when there is nothing to drop, a bare `drop` when a
    /// single value goes, and `drop_keep` otherwise.
    pub(crate) fn emit_drop_keep(&mut self, drop: u32, keep: u8) {
        debug_assert!(drop != INVALID_OFFSET);
        debug_assert!(keep <= 1);
        if drop > 0 {
            if drop == 1 && keep == 0 {
                trace!("emit drop");
                self.emit_opcode(Opcode::Drop);
            } else {
                trace!(drop, keep, "emit drop_keep");
                self.emit_opcode(Opcode::DropKeep);
                self.emit_u32(drop);
                self.emit_u8(keep);
            }
        }
    }

    /// Shrink back to `len` bytes. Used when rolling an environment back
    /// to a mark after a failed load.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_keep_collapses() {
        let mut istream = Istream::default();
        istream.emit_drop_keep(0, 1);
        assert!(istream.is_empty());

        istream.emit_drop_keep(1, 0);
        assert_eq!(istream.as_slice(), [Opcode::Drop as u8]);

        let mut istream = Istream::default();
        istream.emit_drop_keep(2, 1);
        let mut expected = vec![Opcode::DropKeep as u8];
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.push(1);
        assert_eq!(istream.as_slice(), expected);
    }

    #[test]
    fn patch_rewrites_in_place() {
        let mut istream = Istream::default();
        istream.emit_opcode(Opcode::Br);
        let slot = istream.len();
        istream.emit_u32(INVALID_OFFSET);
        istream.emit_opcode(Opcode::Return);
        istream.patch_u32(slot, 6);

        let mut expected = vec![Opcode::Br as u8];
        expected.extend_from_slice(&6u32.to_le_bytes());
        expected.push(Opcode::Return as u8);
        assert_eq!(istream.as_slice(), expected);
    }
}
