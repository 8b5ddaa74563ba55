//! Master-side Stellantriebe command verification and access.
//!
//! An application declares the commands it expects a device to implement;
//! [`StellantriebeDevice::init`] queries the device's live command table by
//! name, checks each declared command's reported length, access and
//! control/real classification against what the application asked for, and
//! records the key and scaling factor the device actually assigned it. No
//! command is usable before `init` has matched it.

use std::cell::RefCell;
use std::rc::Rc;

use feldbus_host::Device;
use feldbus_protocol::BusTransport;

const INFO_GET_COMMANDSET_SIZE: u8 = 0x00;
const INFO_GET_NAME_LENGTH: u8 = 0x01;
const INFO_GET_NAME: u8 = 0x02;
const INFO_GET: u8 = 0x03;

const STRUCTURED_OUTPUT_CONTROL: u8 = 0xFF;
const SET_STRUCTURE: u8 = 0x00;
const TABLE_OK: u8 = 0x01;

/// Marks a command whose factor encodes a control loop's target rather than
/// a physically meaningful scale; matched against the device's reported
/// factor bit-for-bit, the same sentinel both sides agree on out of band.
pub const FACTOR_CONTROL_VALUE: f32 = f32::MAX;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandKind {
    None,
    Char,
    Short,
    Long,
    Float,
    NoneText,
}

impl CommandKind {
    fn wire_width(self) -> u8 {
        match self {
            CommandKind::None | CommandKind::NoneText => 0,
            CommandKind::Char => 1,
            CommandKind::Short => 2,
            CommandKind::Long | CommandKind::Float => 4,
        }
    }

    fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(CommandKind::None),
            0x01 => Some(CommandKind::Char),
            0x02 => Some(CommandKind::Short),
            0x03 => Some(CommandKind::Long),
            0x05 => Some(CommandKind::NoneText),
            0x06 => Some(CommandKind::Float),
            _ => None,
        }
    }
}

/// Whether a command is a "control" loop target (matched against the
/// device's control-sentinel factor) or a "real" physical value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandType {
    Control,
    Real,
}

/// One command the application expects the device to expose, identified by
/// name rather than key — the key is assigned by the device and only
/// discovered during [`StellantriebeDevice::init`].
pub struct Command {
    pub name: &'static str,
    pub access: Access,
    pub kind: CommandKind,
    pub command_type: CommandType,
    key: u8,
    factor: f32,
}

impl Command {
    pub fn new(name: &'static str, access: Access, kind: CommandKind, command_type: CommandType) -> Self {
        Command {
            name,
            access,
            kind,
            command_type,
            key: 0,
            factor: 1.0,
        }
    }

    /// `false` until `init` has matched and keyed this command.
    pub fn is_initialized(&self) -> bool {
        self.key != 0
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

pub struct StellantriebeDevice<T: BusTransport> {
    device: Device<T>,
    commands: Vec<Command>,
}

impl<T: BusTransport> StellantriebeDevice<T> {
    pub fn new(name: &'static str, address: feldbus_protocol::Address,
        width: feldbus_protocol::AddressWidth, checksum_kind: feldbus_checksum::ChecksumKind,
        transport: Rc<RefCell<T>>, commands: Vec<Command>) -> Self {
        StellantriebeDevice {
            device: Device::new(name, address, width, checksum_kind, transport),
            commands,
        }
    }

    pub fn device(&self) -> &Device<T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<T> {
        &mut self.device
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Matches every declared command against the device's live command
    /// table by name, then verifies length, access and control/real
    /// classification. A command that fails any check is left unkeyed;
    /// `init` still scans the rest, returning `false` overall if any
    /// command ended up unmatched or mismatched.
    pub fn init(&mut self) -> bool {
        let name = self.device.name();

        let Some(command_set_size) = self.query_commandset_size() else {
            log::error!("{}: unable to query command set size", name);
            return false;
        };

        let mut all_successful = true;
        for idx in 0..self.commands.len() {
            let mut found = false;
            for key in 1..=command_set_size {
                let Some(name_length) = self.query_name_length(key) else {
                    log::error!("{}: failed to query name length of key {}", name, key);
                    all_successful = false;
                    continue;
                };
                if name_length == 0 {
                    continue;
                }

                let Some(device_name) = self.query_name(key, name_length) else {
                    log::error!("{}: failed to query name of key {}", name, key);
                    all_successful = false;
                    continue;
                };
                if device_name.as_bytes() != self.commands[idx].name.as_bytes() {
                    continue;
                }

                let Some((access, kind, factor)) = self.query_command_info(key) else {
                    log::error!(
                        "{}: failed to query command info for \"{}\" (key {})",
                        name, self.commands[idx].name, key
                    );
                    all_successful = false;
                    continue;
                };

                let command = &self.commands[idx];
                if kind != command.kind {
                    log::error!(
                        "{}: command \"{}\" kind mismatched, device reports {:?}, required {:?}",
                        name, command.name, kind, command.kind
                    );
                    all_successful = false;
                    continue;
                }
                if access != command.access {
                    log::error!(
                        "{}: command \"{}\" access mismatched, device reports {:?}, required {:?}",
                        name, command.name, access, command.access
                    );
                    all_successful = false;
                    continue;
                }
                let device_is_control = factor == FACTOR_CONTROL_VALUE;
                let command_is_control = command.command_type == CommandType::Control;
                if device_is_control != command_is_control {
                    log::error!(
                        "{}: command \"{}\" type mismatched, device reports {}, required {}",
                        name, command.name,
                        if device_is_control { "control" } else { "real" },
                        if command_is_control { "control" } else { "real" },
                    );
                    all_successful = false;
                    continue;
                }

                let command = &mut self.commands[idx];
                command.key = key;
                command.factor = factor;
                found = true;
                break;
            }
            if !found {
                log::error!("{}: command \"{}\" not valid or found in device command set", name, self.commands[idx].name);
                all_successful = false;
            }
        }
        all_successful
    }

    fn query_commandset_size(&mut self) -> Option<u8> {
        let rx = self.device.transceive_raw(
            |tx| {
                tx[0] = 1;
                tx[1] = INFO_GET_COMMANDSET_SIZE;
                tx[2] = 0;
                tx[3] = 0;
            },
            4,
            1,
        )?;
        Some(rx[0])
    }

    fn query_name_length(&mut self, key: u8) -> Option<u8> {
        let rx = self.device.transceive_raw(
            |tx| {
                tx[0] = key;
                tx[1] = INFO_GET_NAME_LENGTH;
                tx[2] = INFO_GET_NAME_LENGTH;
                tx[3] = INFO_GET_NAME_LENGTH;
            },
            4,
            1,
        )?;
        Some(rx[0])
    }

    fn query_name(&mut self, key: u8, name_length: u8) -> Option<String> {
        let rx = self.device.transceive_raw(
            |tx| {
                tx[0] = key;
                tx[1] = INFO_GET_NAME;
                tx[2] = INFO_GET_NAME;
                tx[3] = INFO_GET_NAME;
            },
            4,
            name_length as usize,
        )?;
        String::from_utf8(rx).ok()
    }

    fn query_command_info(&mut self, key: u8) -> Option<(Access, CommandKind, f32)> {
        let rx = self.device.transceive_raw(
            |tx| {
                tx[0] = key;
                tx[1] = INFO_GET;
                tx[2] = INFO_GET;
                tx[3] = INFO_GET;
            },
            4,
            6,
        )?;
        let access = if rx[0] == 0 { Access::Read } else { Access::Write };
        let kind = CommandKind::from_wire_tag(rx[1])?;
        let factor = f32::from_le_bytes([rx[2], rx[3], rx[4], rx[5]]);
        Some((access, kind, factor))
    }

    fn assert_initialized(&self, idx: usize) -> bool {
        if self.commands[idx].is_initialized() {
            true
        } else {
            log::error!(
                "{}: command \"{}\" is not initialized",
                self.device.name(), self.commands[idx].name
            );
            false
        }
    }

    fn command_index(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.name == name)
    }

    /// Reads a command's raw wire bytes. `None` if the command is unknown,
    /// unkeyed, or the transaction failed.
    pub fn get_raw(&mut self, name: &str) -> Option<Vec<u8>> {
        let idx = self.command_index(name)?;
        if !self.assert_initialized(idx) {
            return None;
        }
        let key = self.commands[idx].key;
        let width = self.commands[idx].kind.wire_width() as usize;
        self.device.transceive_raw(|tx| tx[0] = key, 1, width)
    }

    /// Writes a command's raw wire bytes. Only valid for `Access::Write`
    /// commands; the device itself enforces this too, but a mismatched
    /// request would just be silently ignored on the wire.
    pub fn set_raw(&mut self, name: &str, value: &[u8]) -> bool {
        let Some(idx) = self.command_index(name) else { return false };
        if !self.assert_initialized(idx) {
            return false;
        }
        let key = self.commands[idx].key;
        self.device
            .transceive_raw(
                |tx| {
                    tx[0] = key;
                    tx[1..].copy_from_slice(value);
                },
                1 + value.len(),
                0,
            )
            .is_some()
    }

    /// Installs a structured-output table on the device: subsequent reads
    /// of it return every listed command's value concatenated, in one
    /// transaction. Names not found or not yet initialized are skipped.
    pub fn set_structured_output(&mut self, names: &[&str]) -> bool {
        let keys: Vec<u8> = names
            .iter()
            .filter_map(|n| self.command_index(n))
            .map(|idx| self.commands[idx].key)
            .collect();
        if keys.len() != names.len() {
            return false;
        }
        let rx = self.device.transceive_raw(
            |tx| {
                tx[0] = STRUCTURED_OUTPUT_CONTROL;
                tx[1] = SET_STRUCTURE;
                tx[2..].copy_from_slice(&keys);
            },
            2 + keys.len(),
            1,
        );
        matches!(rx, Some(r) if r[0] == TABLE_OK)
    }

    /// Reads the currently installed structured-output table in one
    /// transaction. `expected_len` is the sum of the involved commands'
    /// wire widths, known to the caller from the commands it set up.
    pub fn get_structured_output(&mut self, expected_len: usize) -> Option<Vec<u8>> {
        self.device.transceive_raw(|tx| tx[0] = STRUCTURED_OUTPUT_CONTROL, 1, expected_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feldbus_checksum::ChecksumKind;
    use feldbus_protocol::{Address, AddressWidth, ProtocolId};
    use feldbus_sim::SimTransport;
    use feldbus_slave::SlaveConfig;
    use feldbus_stellantriebe_slave::{
        Access as SlaveAccess, Command as SlaveCommand, CommandHandle, Stellantriebe,
    };

    struct TestConfig;
    impl SlaveConfig for TestConfig {
        const ADDRESS_WIDTH: AddressWidth = AddressWidth::One;
        const MY_ADDRESS: u16 = 9;
        const CHECKSUM_KIND: ChecksumKind = ChecksumKind::Crc8ICode;
        const UPTIME_FREQUENCY_HZ: u16 = 1000;
        const PACKAGE_STATISTICS_AVAILABLE: bool = true;
        const BROADCASTS_AVAILABLE: bool = true;
        const DEVICE_PROTOCOL_ID: ProtocolId = ProtocolId::Stellantriebe;
        const DEVICE_TYPE_ID: u8 = 0x1;
        const DEVICE_NAME: &'static [u8] = b"motor";
        const DEVICE_VERSIONINFO: &'static [u8] = b"v1";
        const UUID: u32 = 0xABCD;
    }

    struct NoopBroadcaster;
    impl feldbus_slave::BroadcastProcessor for NoopBroadcaster {
        fn process_broadcast(&mut self, _protocol_id: ProtocolId, _payload: &[u8]) {}
    }

    fn device_with_commands(
        commands: Vec<Command>,
    ) -> StellantriebeDevice<SimTransport<TestConfig, Stellantriebe<'static, 8>, NoopBroadcaster, 64>> {
        // Leaks are fine in tests: the slave-side command storage must
        // outlive the SimTransport, and test processes are short-lived.
        let speed: &'static mut i16 = Box::leak(Box::new(0i16));
        let commands_storage: &'static mut [SlaveCommand<'static>] =
            Box::leak(Box::new([SlaveCommand::new(SlaveAccess::Write, 1.0, CommandHandle::Short(speed))]));
        let names: &'static [&'static [u8]] = Box::leak(Box::new([b"speed".as_slice()]));
        let dispatcher = Stellantriebe::<8>::new(commands_storage, names, 64, 1);

        let transport = SimTransport::new(dispatcher, NoopBroadcaster);
        StellantriebeDevice::new(
            "motor",
            Address(9),
            AddressWidth::One,
            ChecksumKind::Crc8ICode,
            Rc::new(RefCell::new(transport)),
            commands,
        )
    }

    #[test]
    fn init_matches_commands_by_name_and_keys_them() {
        let mut device = device_with_commands(vec![Command::new(
            "speed",
            Access::Write,
            CommandKind::Short,
            CommandType::Real,
        )]);

        assert!(device.init());
        assert!(device.command("speed").unwrap().is_initialized());
    }

    #[test]
    fn init_fails_when_a_declared_command_is_missing() {
        let mut device = device_with_commands(vec![Command::new(
            "torque",
            Access::Write,
            CommandKind::Short,
            CommandType::Real,
        )]);

        assert!(!device.init());
        assert!(!device.command("torque").unwrap().is_initialized());
    }

    #[test]
    fn get_and_set_raw_round_trip_after_init() {
        let mut device = device_with_commands(vec![Command::new(
            "speed",
            Access::Write,
            CommandKind::Short,
            CommandType::Real,
        )]);
        assert!(device.init());

        assert!(device.set_raw("speed", &300i16.to_le_bytes()));
        let rx = device.get_raw("speed").unwrap();
        assert_eq!(i16::from_le_bytes([rx[0], rx[1]]), 300);
    }
}
