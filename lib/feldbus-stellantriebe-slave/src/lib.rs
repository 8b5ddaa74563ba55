//! Slave-side dispatch for the Stellantriebe (actuator) sub-protocol: a
//! device-defined table of named, typed commands plus a structured-output
//! facility for reading several of them in one transaction.
//!
//! Sits behind [`feldbus_slave::SlaveCore`] as its [`PacketProcessor`]; the
//! base protocol has already stripped the address, handled pings and
//! reserved (`0x00`-prefixed) commands before a packet reaches here.

#![no_std]

use feldbus_slave::{PacketProcessor, PacketResult};
use heapless::Vec as HVec;

/// Wire-level type tag of a command's value. The tag transmitted on the wire
/// (`wire_tag`) is not the same number as the value's byte width
/// (`wire_width`): `Float` tags as `0x06` but still occupies four bytes, the
/// size of the IEEE-754 single it holds.
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
    pub fn wire_tag(self) -> u8 {
        match self {
            CommandKind::None => 0x00,
            CommandKind::Char => 0x01,
            CommandKind::Short => 0x02,
            CommandKind::Long => 0x03,
            CommandKind::NoneText => 0x05,
            CommandKind::Float => 0x06,
        }
    }

    pub fn wire_width(self) -> usize {
        match self {
            CommandKind::None | CommandKind::NoneText => 0,
            CommandKind::Char => 1,
            CommandKind::Short => 2,
            CommandKind::Long | CommandKind::Float => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

/// Borrows the application's storage for a command's value. `None` and
/// `NoneText` commands carry no value and hold neither variant.
pub enum CommandHandle<'a> {
    None,
    NoneText,
    Char(&'a mut i8),
    Short(&'a mut i16),
    Long(&'a mut i32),
    Float(&'a mut f32),
}

impl<'a> CommandHandle<'a> {
    fn kind(&self) -> CommandKind {
        match self {
            CommandHandle::None => CommandKind::None,
            CommandHandle::NoneText => CommandKind::NoneText,
            CommandHandle::Char(_) => CommandKind::Char,
            CommandHandle::Short(_) => CommandKind::Short,
            CommandHandle::Long(_) => CommandKind::Long,
            CommandHandle::Float(_) => CommandKind::Float,
        }
    }

    fn read_into(&self, out: &mut [u8]) -> usize {
        match self {
            CommandHandle::None | CommandHandle::NoneText => 0,
            CommandHandle::Char(v) => {
                out[0] = v.to_le_bytes()[0];
                1
            }
            CommandHandle::Short(v) => {
                out[..2].copy_from_slice(&v.to_le_bytes());
                2
            }
            CommandHandle::Long(v) => {
                out[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            CommandHandle::Float(v) => {
                out[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
        }
    }

    fn write_from(&mut self, data: &[u8]) {
        let width = self.kind().wire_width();
        let n = data.len().min(width);
        let mut raw = [0u8; 4];
        raw[..n].copy_from_slice(&data[..n]);
        match self {
            CommandHandle::None | CommandHandle::NoneText => {}
            CommandHandle::Char(v) => **v = raw[0] as i8,
            CommandHandle::Short(v) => **v = i16::from_le_bytes([raw[0], raw[1]]),
            CommandHandle::Long(v) => **v = i32::from_le_bytes(raw),
            CommandHandle::Float(v) => **v = f32::from_le_bytes(raw),
        }
    }
}

/// One entry of the device's command table, keyed by its 1-based position.
pub struct Command<'a> {
    pub access: Access,
    /// Scaling factor applied on the host side; the slave only stores and
    /// reports it, it never multiplies or divides by it itself.
    pub factor: f32,
    pub handle: CommandHandle<'a>,
}

impl<'a> Command<'a> {
    pub fn new(access: Access, factor: f32, handle: CommandHandle<'a>) -> Self {
        Command { access, factor, handle }
    }
}

const INFO_GET_COMMANDSET_SIZE: u8 = 0x00;
const INFO_GET_NAME_LENGTH: u8 = 0x01;
const INFO_GET_NAME: u8 = 0x02;
const INFO_GET: u8 = 0x03;

const STRUCTURED_OUTPUT_CONTROL: u8 = 0xFF;
const SET_STRUCTURE: u8 = 0x00;
const GET_BUFFER_SIZE: u8 = 0x01;
const TABLE_REJECTED: u8 = 0x00;
const TABLE_OK: u8 = 0x01;

/// Dispatches Stellantriebe packets against an application-provided command
/// table. `STRUCT_CAP` bounds how many keys the structured-output table can
/// hold at once, a compile-time limit on the slave's fixed memory.
pub struct Stellantriebe<'a, const STRUCT_CAP: usize> {
    commands: &'a mut [Command<'a>],
    names: &'a [&'a [u8]],
    buffer_size: usize,
    addr_len: usize,
    structured_output: HVec<u8, STRUCT_CAP>,
    on_update: Option<&'a mut dyn FnMut(usize)>,
}

impl<'a, const STRUCT_CAP: usize> Stellantriebe<'a, STRUCT_CAP> {
    /// `buffer_size` is the slave's whole wire buffer (`N` of `SlaveCore`),
    /// `addr_len` the width of the address field — both are needed to judge
    /// whether a structured-output table would overflow the reply.
    pub fn new(
        commands: &'a mut [Command<'a>],
        names: &'a [&'a [u8]],
        buffer_size: usize,
        addr_len: usize,
    ) -> Self {
        assert_eq!(commands.len(), names.len());
        Stellantriebe {
            commands,
            names,
            buffer_size,
            addr_len,
            structured_output: HVec::new(),
            on_update: None,
        }
    }

    pub fn with_update_handler(mut self, handler: &'a mut dyn FnMut(usize)) -> Self {
        self.on_update = Some(handler);
        self
    }

    fn dispatch_read(&self, index: usize, response: &mut [u8]) -> PacketResult {
        let command = &self.commands[index];
        match command.handle.kind() {
            CommandKind::None | CommandKind::NoneText => PacketResult::IgnorePacket,
            _ => {
                let n = command.handle.read_into(response);
                PacketResult::Reply(n)
            }
        }
    }

    fn dispatch_write(&mut self, index: usize, data: &[u8]) -> PacketResult {
        let command = &mut self.commands[index];
        if command.access != Access::Write {
            return PacketResult::IgnorePacket;
        }
        match command.handle.kind() {
            CommandKind::None | CommandKind::NoneText => PacketResult::IgnorePacket,
            _ => {
                command.handle.write_from(data);
                if let Some(handler) = self.on_update.as_mut() {
                    handler(index);
                }
                PacketResult::Reply(0)
            }
        }
    }

    fn dispatch_info(&self, index: usize, sub: u8, response: &mut [u8]) -> PacketResult {
        let command = &self.commands[index];
        match sub {
            INFO_GET_COMMANDSET_SIZE => {
                response[0] = self.commands.len() as u8;
                PacketResult::Reply(1)
            }
            INFO_GET_NAME_LENGTH => {
                response[0] = self.names[index].len() as u8;
                PacketResult::Reply(1)
            }
            INFO_GET_NAME => {
                let name = self.names[index];
                response[..name.len()].copy_from_slice(name);
                PacketResult::Reply(name.len())
            }
            INFO_GET => {
                response[0] = match command.access {
                    Access::Read => 0,
                    Access::Write => 1,
                };
                response[1] = command.handle.kind().wire_tag();
                response[2..6].copy_from_slice(&command.factor.to_le_bytes());
                PacketResult::Reply(6)
            }
            _ => PacketResult::IgnorePacket,
        }
    }

    /// Validates `keys` against the command table and the slave's buffer
    /// budget. On success the table is replaced; on any failure it is
    /// cleared entirely rather than left partially applied.
    fn set_structure(&mut self, keys: &[u8]) -> bool {
        let accepted = keys.len() <= STRUCT_CAP && {
            let mut size_sum = 0usize;
            keys.iter().all(|&key| {
                key != 0
                    && (key as usize) <= self.commands.len()
                    && {
                        let width = self.commands[key as usize - 1].handle.kind().wire_width();
                        size_sum += width;
                        width != 0 && size_sum + self.addr_len + 1 <= self.buffer_size
                    }
            })
        };

        self.structured_output.clear();
        if accepted {
            // Capacity was already checked above; this cannot fail.
            let _ = self.structured_output.extend_from_slice(keys);
        }
        accepted
    }

    fn read_structured_output(&self, response: &mut [u8]) -> PacketResult {
        let mut offset = 0;
        for &key in self.structured_output.iter() {
            let command = &self.commands[key as usize - 1];
            offset += command.handle.read_into(&mut response[offset..]);
        }
        PacketResult::Reply(offset)
    }
}

impl<'a, const STRUCT_CAP: usize> PacketProcessor for Stellantriebe<'a, STRUCT_CAP> {
    fn process_packet(&mut self, request: &[u8], response: &mut [u8]) -> PacketResult {
        if request.is_empty() {
            return PacketResult::IgnorePacket;
        }

        if request[0] == STRUCTURED_OUTPUT_CONTROL {
            if request.len() == 1 {
                return self.read_structured_output(response);
            }
            return match request[1] {
                SET_STRUCTURE => {
                    let accepted = self.set_structure(&request[2..]);
                    response[0] = if accepted { TABLE_OK } else { TABLE_REJECTED };
                    PacketResult::Reply(1)
                }
                GET_BUFFER_SIZE => {
                    response[0] = STRUCT_CAP as u8;
                    PacketResult::Reply(1)
                }
                _ => PacketResult::IgnorePacket,
            };
        }

        let index = request[0].wrapping_sub(1) as usize;
        if index >= self.commands.len() {
            return PacketResult::IgnorePacket;
        }

        if request.len() == 1 {
            self.dispatch_read(index, response)
        } else if request.len() != 4 {
            self.dispatch_write(index, &request[1..])
        } else {
            self.dispatch_info(index, request[1], response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> [&'static [u8]; 3] {
        [b"speed", b"position", b"enabled"]
    }

    #[test]
    fn read_returns_current_value() {
        let mut speed = 1234i16;
        let mut position = 0i32;
        let mut enabled = 0i8;
        let mut commands = [
            Command::new(Access::Write, 1.0, CommandHandle::Short(&mut speed)),
            Command::new(Access::Write, 1.0, CommandHandle::Long(&mut position)),
            Command::new(Access::Write, 1.0, CommandHandle::Char(&mut enabled)),
        ];
        let names = names();
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(&[1], &mut response);
        assert_eq!(result, PacketResult::Reply(2));
        assert_eq!(i16::from_le_bytes([response[0], response[1]]), 1234);
    }

    #[test]
    fn write_updates_storage_and_fires_handler() {
        let mut speed = 0i16;
        let mut commands = [Command::new(Access::Write, 1.0, CommandHandle::Short(&mut speed))];
        let names: [&[u8]; 1] = [b"speed"];
        let mut updated = None;
        let mut on_update = |index: usize| updated = Some(index);
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1)
            .with_update_handler(&mut on_update);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(&[1, 0x2C, 0x01], &mut response);
        assert_eq!(result, PacketResult::Reply(0));
        assert_eq!(speed, 0x012C);
        assert_eq!(updated, Some(0));
    }

    #[test]
    fn write_to_read_only_command_is_ignored() {
        let mut speed = 0i16;
        let mut commands = [Command::new(Access::Read, 1.0, CommandHandle::Short(&mut speed))];
        let names: [&[u8]; 1] = [b"speed"];
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(&[1, 0x01, 0x00], &mut response);
        assert_eq!(result, PacketResult::IgnorePacket);
        assert_eq!(speed, 0);
    }

    #[test]
    fn commandset_size_and_name_introspection() {
        let mut speed = 0i16;
        let mut commands = [Command::new(Access::Write, 1.0, CommandHandle::Short(&mut speed))];
        let names: [&[u8]; 1] = [b"speed"];
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(&[1, INFO_GET_COMMANDSET_SIZE, 0, 0], &mut response);
        assert_eq!(result, PacketResult::Reply(1));
        assert_eq!(response[0], 1);

        let result = dispatcher.process_packet(&[1, INFO_GET_NAME_LENGTH, 0, 0], &mut response);
        assert_eq!(result, PacketResult::Reply(1));
        assert_eq!(response[0], 5);

        let result = dispatcher.process_packet(&[1, INFO_GET_NAME, 0, 0], &mut response);
        assert_eq!(result, PacketResult::Reply(5));
        assert_eq!(&response[..5], b"speed");

        let result = dispatcher.process_packet(&[1, INFO_GET, 0, 0], &mut response);
        assert_eq!(result, PacketResult::Reply(6));
        assert_eq!(response[0], 1);
        assert_eq!(response[1], CommandKind::Short.wire_tag());
    }

    #[test]
    fn structured_output_set_read_and_reject() {
        let mut a = 1i16;
        let mut b = 2i32;
        let mut commands = [
            Command::new(Access::Write, 1.0, CommandHandle::Short(&mut a)),
            Command::new(Access::Write, 1.0, CommandHandle::Long(&mut b)),
        ];
        let names: [&[u8]; 2] = [b"a", b"b"];
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(
            &[STRUCTURED_OUTPUT_CONTROL, SET_STRUCTURE, 1, 2],
            &mut response,
        );
        assert_eq!(result, PacketResult::Reply(1));
        assert_eq!(response[0], TABLE_OK);

        let result = dispatcher.process_packet(&[STRUCTURED_OUTPUT_CONTROL], &mut response);
        assert_eq!(result, PacketResult::Reply(6));
        assert_eq!(i16::from_le_bytes([response[0], response[1]]), 1);
        assert_eq!(i32::from_le_bytes([response[2], response[3], response[4], response[5]]), 2);

        // Unknown key rejects and clears the table.
        let result = dispatcher.process_packet(
            &[STRUCTURED_OUTPUT_CONTROL, SET_STRUCTURE, 9],
            &mut response,
        );
        assert_eq!(result, PacketResult::Reply(1));
        assert_eq!(response[0], TABLE_REJECTED);

        let result = dispatcher.process_packet(&[STRUCTURED_OUTPUT_CONTROL], &mut response);
        assert_eq!(result, PacketResult::Reply(0));
    }

    #[test]
    fn structured_output_rejects_commands_with_no_width() {
        let mut text_holder = 0i8;
        let mut commands = [Command::new(Access::Read, 1.0, CommandHandle::NoneText)];
        let _ = &mut text_holder;
        let names: [&[u8]; 1] = [b"status"];
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(
            &[STRUCTURED_OUTPUT_CONTROL, SET_STRUCTURE, 1],
            &mut response,
        );
        assert_eq!(result, PacketResult::Reply(1));
        assert_eq!(response[0], TABLE_REJECTED);
    }

    #[test]
    fn get_buffer_size_reports_the_compile_time_bound() {
        let mut speed = 0i16;
        let mut commands = [Command::new(Access::Write, 1.0, CommandHandle::Short(&mut speed))];
        let names: [&[u8]; 1] = [b"speed"];
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(
            &[STRUCTURED_OUTPUT_CONTROL, GET_BUFFER_SIZE],
            &mut response,
        );
        assert_eq!(result, PacketResult::Reply(1));
        assert_eq!(response[0], 8);
    }

    #[test]
    fn unknown_key_is_ignored() {
        let mut speed = 0i16;
        let mut commands = [Command::new(Access::Write, 1.0, CommandHandle::Short(&mut speed))];
        let names: [&[u8]; 1] = [b"speed"];
        let mut dispatcher = Stellantriebe::<8>::new(&mut commands, &names, 16, 1);

        let mut response = [0u8; 8];
        let result = dispatcher.process_packet(&[5], &mut response);
        assert_eq!(result, PacketResult::IgnorePacket);
    }
}
