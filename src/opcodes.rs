//! HCI Command Opcodes
//!
//! Opcodes are composed of a group identifier and an individual command identifier specific to
//! the group. The group identifier and individual identifier are put together to form the raw
//! 16 bit opcode value that is carried within a command packet and echoed back by the controller
//! within the *Command Complete* and *Command Status* events.
//!
//! Instead of using group and command codes to create an opcode, the enum [`HciCommand`] should
//! be used. Commands not enumerated here can be issued through [`HciCommand::Raw`].

/// Enumerations of the HCI command opcodes used by this crate
///
/// `HciCommand` consists of the HCI command groups containing the commands within the group. The
/// groups and commands listed are the ones issued by this layer or its immediate consumers, any
/// other command can be expressed with the `Raw` variant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HciCommand {
    LinkControl(LinkControl),
    ControllerAndBaseband(ControllerAndBaseband),
    InformationParameters(InformationParameters),
    LEController(LEController),
    /// Any other command, given as its raw OGF and OCF pair
    Raw(OpCodePair),
}

impl HciCommand {
    /// Get the opcode for this command
    pub const fn into_opcode(self) -> u16 {
        self.into_opcode_pair().into_opcode()
    }

    /// Get the `OpCodePair` for this command
    pub const fn into_opcode_pair(self) -> OpCodePair {
        match self {
            HciCommand::LinkControl(ocf) => ocf.into_opcode_pair(),
            HciCommand::ControllerAndBaseband(ocf) => ocf.into_opcode_pair(),
            HciCommand::InformationParameters(ocf) => ocf.into_opcode_pair(),
            HciCommand::LEController(ocf) => ocf.into_opcode_pair(),
            HciCommand::Raw(pair) => pair,
        }
    }
}

impl core::fmt::Display for HciCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let opcode = self.into_opcode_pair();

        match self {
            HciCommand::LinkControl(c) => write!(f, "link control - {:?} ({:#x}:{:#x})", c, opcode.ogf, opcode.ocf),
            HciCommand::ControllerAndBaseband(c) => {
                write!(f, "controller and baseband - {:?} ({:#x}:{:#x})", c, opcode.ogf, opcode.ocf)
            }
            HciCommand::InformationParameters(c) => {
                write!(f, "information parameters - {:?} ({:#x}:{:#x})", c, opcode.ogf, opcode.ocf)
            }
            HciCommand::LEController(c) => write!(f, "LE controller - {:?} ({:#x}:{:#x})", c, opcode.ogf, opcode.ocf),
            HciCommand::Raw(_) => write!(f, "raw command ({:#x}:{:#x})", opcode.ogf, opcode.ocf),
        }
    }
}

/// Link control commands
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkControl {
    Disconnect,
}

impl LinkControl {
    const OGF: u16 = 0x1;

    pub const fn into_opcode_pair(self) -> OpCodePair {
        let ocf = match self {
            LinkControl::Disconnect => 0x6,
        };

        OpCodePair { ogf: Self::OGF, ocf }
    }
}

/// Controller and baseband commands
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControllerAndBaseband {
    Reset,
}

impl ControllerAndBaseband {
    const OGF: u16 = 0x3;

    pub const fn into_opcode_pair(self) -> OpCodePair {
        let ocf = match self {
            ControllerAndBaseband::Reset => 0x3,
        };

        OpCodePair { ogf: Self::OGF, ocf }
    }
}

/// Information parameters commands
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InformationParameters {
    ReadLocalVersionInformation,
    ReadBufferSize,
}

impl InformationParameters {
    const OGF: u16 = 0x4;

    pub const fn into_opcode_pair(self) -> OpCodePair {
        let ocf = match self {
            InformationParameters::ReadLocalVersionInformation => 0x1,
            InformationParameters::ReadBufferSize => 0x5,
        };

        OpCodePair { ogf: Self::OGF, ocf }
    }
}

/// LE controller commands
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LEController {
    ReadBufferSize,
}

impl LEController {
    const OGF: u16 = 0x8;

    pub const fn into_opcode_pair(self) -> OpCodePair {
        let ocf = match self {
            LEController::ReadBufferSize => 0x2,
        };

        OpCodePair { ogf: Self::OGF, ocf }
    }
}

/// A type for the pair of OGF (OpCode Group Field) and OCF (OpCode Command Field)
///
/// The main use for this is converting between the grouped command identifiers and the numerical
/// opcode value passed over the interface to the controller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OpCodePair {
    pub ogf: u16,
    pub ocf: u16,
}

impl OpCodePair {
    /// The opcode value a *Command Complete* event carries when it acknowledges no command
    ///
    /// The controller sends events with this opcode solely to update the command credit count.
    pub const NO_COMMAND: u16 = 0;

    /// Convert the `OpCodePair` into the raw opcode
    ///
    /// The returned value is the opcode used when building a HCI command packet. The OCF field
    /// occupies the lower 10 bits and the OGF field the upper 6 bits.
    pub const fn into_opcode(self) -> u16 {
        (self.ocf & 0x3FF) | (self.ogf << 10)
    }

    /// Convert a raw opcode into an `OpCodePair`
    pub const fn from_opcode(opcode: u16) -> Self {
        OpCodePair {
            ogf: opcode >> 10,
            ocf: opcode & 0x3FF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_packing() {
        assert_eq!(
            0xC03,
            HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset).into_opcode()
        );

        assert_eq!(0x406, HciCommand::LinkControl(LinkControl::Disconnect).into_opcode());

        let pair = OpCodePair::from_opcode(0x2002);

        assert_eq!(0x8, pair.ogf);
        assert_eq!(0x2, pair.ocf);
        assert_eq!(
            HciCommand::LEController(LEController::ReadBufferSize).into_opcode(),
            pair.into_opcode()
        );
    }
}
