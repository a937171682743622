//! JTAG IDCODE decoding.

use bitfield::bitfield;

/// The Microsemi JEDEC identity in the low 12 IDCODE bits.
pub const MICROSEMI_JEDEC: u32 = 0x1cf;

/// Masked family field identifying a G5 device on the chain.
pub const G5_FAMILY_MASK: u32 = 0x0fff_0000;
/// Expected masked family value for the G5 family.
pub const G5_FAMILY: u32 = 0x0f81_0000;

bitfield! {
    /// A JTAG IDCODE as captured from the device.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// Silicon revision.
    pub revision, set_revision: 31, 28;

    u16;
    /// Part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 manufacturer id.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// JEP-106 continuation code.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// JEP-106 identity code.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// Always-set least-significant marker bit.
    pub lsbit, set_lsbit: 0;
}

impl IdCode {
    /// Wrap a captured register value.
    pub fn new(raw: u32) -> Self {
        IdCode(raw)
    }

    /// The raw register value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Manufacturer name from the JEP-106 tables, if known.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        jep106::JEP106Code::new(self.manufacturer_continuation(), self.manufacturer_identity())
            .get()
    }

    /// Whether the masked value identifies a G5-family device.
    pub fn is_g5_family(raw: u32) -> bool {
        raw & G5_FAMILY_MASK == G5_FAMILY
    }
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010X} rev {:X}", self.0, self.revision())?;
        match self.manufacturer_name() {
            Some(name) => write!(f, ", {name}")?,
            None => write!(f, ", manufacturer {:#05x}", self.manufacturer())?,
        }
        if IdCode::is_g5_family(self.0) {
            write!(f, ", G5 family")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_decode() {
        let id = IdCode(0xff81_11cf);
        assert_eq!(id.revision(), 0xf);
        assert!(id.lsbit());
        assert_eq!(id.raw() & 0xfff, MICROSEMI_JEDEC);
    }

    #[test]
    fn family_gate() {
        assert!(IdCode::is_g5_family(0x0f81_11cf));
        assert!(IdCode::is_g5_family(0xff81_11cf));
        assert!(!IdCode::is_g5_family(0x0f82_11cf));
    }

    #[test]
    fn display_reports_revision_and_family() {
        let g5 = format!("{}", IdCode::new(0x2f81_11cf));
        assert!(g5.starts_with("0x2F8111CF rev 2"), "{g5}");
        assert!(g5.ends_with("G5 family"), "{g5}");

        let other = format!("{}", IdCode::new(0x4ba0_0477));
        assert!(!other.contains("G5 family"), "{other}");
    }
}
