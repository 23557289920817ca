//! States of the read-side reassembly machine and the record decision table.

use crate::error::{FrameError, Result};
use crate::wire::{flags, RipcHeader, HEADER_SIZE};

/// Primary state of the read buffer.
///
/// `Unknown*` states have not decoded the current record's length yet,
/// `Known*` states have. `*Incomplete` means the read buffer still has room
/// for the missing bytes; `*Insufficient` means it must be compacted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadBufferState {
    NoData,
    UnknownIncomplete,
    UnknownInsufficient,
    KnownIncomplete,
    KnownInsufficient,
    KnownComplete,
    EndOfStream,
}

impl ReadBufferState {
    pub fn is_insufficient(self) -> bool {
        matches!(self, Self::UnknownInsufficient | Self::KnownInsufficient)
    }
}

/// What kind of record the machine is working through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadBufferSubState {
    Normal,
    ProcessingCompressed,
    ProcessingFragmented,
    ProcessingFragmentedCompressed,
    ProcessingPacked,
    ProcessingPackedCompressed,
    ProcessingCompleteFragmented,
    ProcessingCompleteFragmentedJson,
}

/// Outcome of one socket read, as handed to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// This many bytes were appended to the read buffer (possibly zero).
    Bytes(usize),
    /// The peer closed its side of the stream.
    EndOfStream,
}

/// Which reconstruction path owns a half-received compressed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompFragmentOrigin {
    /// A plain compressed record.
    Standalone,
    /// A packed compressed record.
    Packed,
    /// A fragment of the given logical message.
    Fragment(u16),
}

/// The transition chosen for a complete record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordAction {
    Ping,
    Plain,
    Packed,
    PackedCompressed,
    PackedCompFragmentFirst,
    Fragmented { compressed: bool },
    Compressed,
    CompFragmentFirst,
    CompFragmentSecond(CompFragmentOrigin),
}

impl RecordAction {
    /// Decide how to process a complete record.
    ///
    /// Keyed by (packing, fragmented, compressed, comp-fragment bit, pending
    /// first half). Packing and fragmentation never appear together;
    /// compression composes with either.
    pub(crate) fn classify(
        header: &RipcHeader,
        pending: Option<CompFragmentOrigin>,
    ) -> Result<Self> {
        if header.length < HEADER_SIZE {
            return Err(FrameError::MalformedHeader(
                "record length shorter than its header",
            ));
        }
        if header.is_ping() {
            return Ok(Self::Ping);
        }

        let packing = header.has(flags::PACKING);
        let fragmented = header.has(flags::HAS_OPTIONAL_FLAGS);
        let compressed = header.has(flags::COMPRESSION);
        let comp_fragment = header.has(flags::COMP_FRAGMENT);

        let action = match (packing, fragmented, compressed) {
            (true, true, _) => {
                return Err(FrameError::MalformedHeader(
                    "packing and fragmentation are mutually exclusive",
                ))
            }
            (true, false, false) => Self::Packed,
            (true, false, true) if comp_fragment => Self::PackedCompFragmentFirst,
            (true, false, true) => match pending {
                Some(CompFragmentOrigin::Packed) => {
                    Self::CompFragmentSecond(CompFragmentOrigin::Packed)
                }
                _ => Self::PackedCompressed,
            },
            (false, true, compressed) => Self::Fragmented { compressed },
            (false, false, true) => match pending {
                Some(origin) => Self::CompFragmentSecond(origin),
                None if comp_fragment => Self::CompFragmentFirst,
                None => Self::Compressed,
            },
            (false, false, false) => Self::Plain,
        };
        Ok(action)
    }

    /// Sub-state entered when the action starts.
    pub(crate) fn sub_state(self) -> ReadBufferSubState {
        match self {
            Self::Ping | Self::Plain | Self::CompFragmentFirst => ReadBufferSubState::Normal,
            Self::Packed => ReadBufferSubState::ProcessingPacked,
            Self::PackedCompressed | Self::PackedCompFragmentFirst => {
                ReadBufferSubState::ProcessingPackedCompressed
            }
            Self::Fragmented { compressed: false } => ReadBufferSubState::ProcessingFragmented,
            Self::Fragmented { compressed: true } => {
                ReadBufferSubState::ProcessingFragmentedCompressed
            }
            Self::Compressed => ReadBufferSubState::ProcessingCompressed,
            Self::CompFragmentSecond(CompFragmentOrigin::Standalone) => ReadBufferSubState::Normal,
            Self::CompFragmentSecond(CompFragmentOrigin::Packed) => {
                ReadBufferSubState::ProcessingPackedCompressed
            }
            Self::CompFragmentSecond(CompFragmentOrigin::Fragment(_)) => {
                ReadBufferSubState::ProcessingFragmentedCompressed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(length: usize, bits: u8) -> RipcHeader {
        RipcHeader {
            length,
            flags: bits,
        }
    }

    fn classify(bits: u8, pending: Option<CompFragmentOrigin>) -> Result<RecordAction> {
        RecordAction::classify(&header(20, bits), pending)
    }

    #[test]
    fn test_ping_wins_over_flags() {
        let action = RecordAction::classify(&header(3, flags::PACKING), None).unwrap();
        assert_eq!(action, RecordAction::Ping);
    }

    #[test]
    fn test_short_record_is_malformed() {
        let result = RecordAction::classify(&header(2, flags::DATA), None);
        assert!(matches!(result, Err(FrameError::MalformedHeader(_))));
    }

    #[test]
    fn test_packing_and_fragmentation_rejected() {
        let result = classify(flags::PACKING | flags::HAS_OPTIONAL_FLAGS, None);
        assert!(matches!(result, Err(FrameError::MalformedHeader(_))));
    }

    #[test]
    fn test_decision_table() {
        use CompFragmentOrigin as Origin;
        use RecordAction::*;

        let cases = [
            (flags::DATA, None, Plain),
            (flags::PACKING, None, Packed),
            (flags::PACKING | flags::COMPRESSION, None, PackedCompressed),
            (
                flags::PACKING | flags::COMPRESSION | flags::COMP_FRAGMENT,
                None,
                PackedCompFragmentFirst,
            ),
            (
                flags::PACKING | flags::COMPRESSION,
                Some(Origin::Packed),
                CompFragmentSecond(Origin::Packed),
            ),
            (flags::HAS_OPTIONAL_FLAGS, None, Fragmented { compressed: false }),
            (
                flags::HAS_OPTIONAL_FLAGS | flags::COMPRESSION,
                None,
                Fragmented { compressed: true },
            ),
            (flags::COMPRESSION, None, Compressed),
            (flags::COMPRESSION | flags::COMP_FRAGMENT, None, CompFragmentFirst),
            (flags::COMPRESSION, Some(Origin::Standalone), CompFragmentSecond(Origin::Standalone)),
            (flags::COMPRESSION, Some(Origin::Fragment(7)), CompFragmentSecond(Origin::Fragment(7))),
            (flags::COMPRESSION, Some(Origin::Packed), CompFragmentSecond(Origin::Packed)),
        ];

        for (bits, pending, expected) in cases {
            assert_eq!(
                classify(bits, pending).unwrap(),
                expected,
                "flags {bits:#04x} pending {pending:?}"
            );
        }
    }

    #[test]
    fn test_sub_states() {
        assert_eq!(
            RecordAction::Fragmented { compressed: true }.sub_state(),
            ReadBufferSubState::ProcessingFragmentedCompressed
        );
        assert_eq!(
            RecordAction::CompFragmentSecond(CompFragmentOrigin::Packed).sub_state(),
            ReadBufferSubState::ProcessingPackedCompressed
        );
        assert_eq!(
            RecordAction::Compressed.sub_state(),
            ReadBufferSubState::ProcessingCompressed
        );
    }
}
