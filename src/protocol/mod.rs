//! Furby Connect wire protocol definitions
//!
//! Command and response identifiers for the two onboard microcontrollers
//! (GeneralPlus handles behavior, Nordic handles the radio and file
//! transfer acks), plus packet builders and parsers. Identifier tables
//! follow the bluefluff reverse-engineering notes.

use serde::{Deserialize, Serialize};

/// Largest payload the toy accepts in a single BLE write.
pub const MAX_PACKET_SIZE: usize = 20;

/// Default chunk size for content transfers (one BLE packet per chunk).
pub const FILE_CHUNK_SIZE: usize = 20;

/// Nordic command/response identifier for per-packet acknowledgements.
pub const NORDIC_PACKET_ACK: u8 = 0x09;

/// GeneralPlus command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralPlusCommand {
    TriggerActionByInput = 0x10,
    TriggerActionByIndex = 0x11,
    TriggerActionBySubindex = 0x12,
    TriggerSpecificAction = 0x13,
    SetAntennaColor = 0x14,
    SetName = 0x21,
    SetMoodMeter = 0x23,
    SetNotifications = 0x31,
    AnnounceUpload = 0x50,
    DeleteFile = 0x53,
    GetFileSize = 0x54,
    GetChecksum = 0x55,
    LoadSlot = 0x60,
    ActivateContent = 0x61,
    DeactivateSlot = 0x62,
    GetSlotStates = 0x72,
    GetSlotInfo = 0x73,
    DeleteSlot = 0x74,
    LcdDebugMenu = 0xDB,
    LcdBacklight = 0xCD,
    GetFirmwareVersion = 0xFE,
}

/// GeneralPlus response identifiers (first byte of a notification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralPlusResponse {
    FurbyMessage = 0x20,
    SensorStatus = 0x21,
    ImHere = 0x22,
    CurrentMode = 0x23,
    FileTransferMode = 0x24,
    Language = 0x25,
    FurbiesMet = 0x26,
    GotFileSize = 0x54,
    GotFileChecksum = 0x55,
    SlotStates = 0x72,
    GotSlotInfo = 0x73,
    GotDeleteSlot = 0x74,
    ReportContent = 0xDC,
    FirmwareVersion = 0xFE,
}

/// Status messages embedded in `FurbyMessage` (0x20) notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FurbyMessage {
    EnteredNamingMode = 0x01,
    ExitedNamingMode = 0x02,
    FurbyNamed = 0x03,
    EnteredAppMode = 0x04,
    ExitedAppMode = 0x05,
    ResponsePlayed = 0x06,
    SpeechPlaying = 0x07,
    SlaveAck = 0x08,
    MaskAdded = 0x0A,
    MaskRemoved = 0x0B,
    SequencePlaying = 0x0C,
    SequenceCancelled = 0x0D,
    SequenceEnded = 0x0E,
    InputOutOfRange = 0x0F,
    IndexOutOfRange = 0x10,
    SubindexOutOfRange = 0x11,
    SpecificOutOfRange = 0x12,
    SleepMaskAdded = 0x13,
    SleepMaskRemoved = 0x14,
    LcdOn = 0x17,
    LcdOff = 0x18,
}

impl FurbyMessage {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::EnteredNamingMode,
            0x02 => Self::ExitedNamingMode,
            0x03 => Self::FurbyNamed,
            0x04 => Self::EnteredAppMode,
            0x05 => Self::ExitedAppMode,
            0x06 => Self::ResponsePlayed,
            0x07 => Self::SpeechPlaying,
            0x08 => Self::SlaveAck,
            0x0A => Self::MaskAdded,
            0x0B => Self::MaskRemoved,
            0x0C => Self::SequencePlaying,
            0x0D => Self::SequenceCancelled,
            0x0E => Self::SequenceEnded,
            0x0F => Self::InputOutOfRange,
            0x10 => Self::IndexOutOfRange,
            0x11 => Self::SubindexOutOfRange,
            0x12 => Self::SpecificOutOfRange,
            0x13 => Self::SleepMaskAdded,
            0x14 => Self::SleepMaskRemoved,
            0x17 => Self::LcdOn,
            0x18 => Self::LcdOff,
            _ => return None,
        })
    }
}

/// Content transfer sub-states reported in `FileTransferMode` (0x24)
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileTransferMode {
    FileAlreadyExists = 0x01,
    ReadyToReceive = 0x02,
    TransferTimeout = 0x03,
    ReadyToAppend = 0x04,
    ReceivedOk = 0x05,
    ReceivedError = 0x06,
}

impl FileTransferMode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::FileAlreadyExists,
            0x02 => Self::ReadyToReceive,
            0x03 => Self::TransferTimeout,
            0x04 => Self::ReadyToAppend,
            0x05 => Self::ReceivedOk,
            0x06 => Self::ReceivedError,
            _ => return None,
        })
    }
}

/// The five mood meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MoodType {
    Excitedness = 0x00,
    Displeasedness = 0x01,
    Tiredness = 0x02,
    Fullness = 0x03,
    Wellness = 0x04,
}

impl MoodType {
    /// State-cache key suffix for this meter.
    pub fn key(self) -> &'static str {
        match self {
            Self::Excitedness => "excitedness",
            Self::Displeasedness => "displeasedness",
            Self::Tiredness => "tiredness",
            Self::Fullness => "fullness",
            Self::Wellness => "wellness",
        }
    }
}

/// Whether a mood command sets an absolute value or adds a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodAction {
    Set,
    Increase,
}

/// State of a device-side content slot as carried in slot-state packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Uploading,
    Uploaded,
    Active,
}

impl SlotState {
    pub fn code(self) -> u8 {
        match self {
            Self::Empty => 0x00,
            Self::Uploading => 0x01,
            Self::Uploaded => 0x02,
            Self::Active => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::Empty,
            0x01 => Self::Uploading,
            0x02 => Self::Uploaded,
            0x03 => Self::Active,
            _ => return None,
        })
    }
}

// Command builders. Each returns one complete GeneralPlus/Nordic packet.

/// Set the antenna LED color.
pub fn set_antenna(red: u8, green: u8, blue: u8) -> Vec<u8> {
    vec![GeneralPlusCommand::SetAntennaColor as u8, red, green, blue]
}

/// Trigger a specific action sequence.
pub fn trigger_action(input: u8, index: u8, subindex: u8, specific: u8) -> Vec<u8> {
    vec![
        GeneralPlusCommand::TriggerSpecificAction as u8,
        0x00,
        input,
        index,
        subindex,
        specific,
    ]
}

/// Switch the LCD backlight on or off.
pub fn set_lcd_backlight(on: bool) -> Vec<u8> {
    vec![GeneralPlusCommand::LcdBacklight as u8, u8::from(on)]
}

/// Cycle to the next LCD debug menu.
pub fn cycle_debug_menu() -> Vec<u8> {
    vec![GeneralPlusCommand::LcdDebugMenu as u8]
}

/// Set the toy's name by name id (0-128).
pub fn set_name(name_id: u8) -> Vec<u8> {
    vec![GeneralPlusCommand::SetName as u8, name_id]
}

/// Set or nudge a mood meter.
pub fn set_mood(action: MoodAction, mood: MoodType, value: u8) -> Vec<u8> {
    let action_byte = match action {
        MoodAction::Set => 0x01,
        MoodAction::Increase => 0x00,
    };
    vec![
        GeneralPlusCommand::SetMoodMeter as u8,
        action_byte,
        mood as u8,
        value,
    ]
}

/// Announce an upcoming content upload. `size` is sent as a 24-bit
/// big-endian length; the filename is ASCII, truncated/padded to 12 bytes.
pub fn announce_upload(size: usize, slot: u8, filename: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MAX_PACKET_SIZE);
    packet.push(GeneralPlusCommand::AnnounceUpload as u8);
    packet.push(((size >> 16) & 0xFF) as u8);
    packet.push(((size >> 8) & 0xFF) as u8);
    packet.push((size & 0xFF) as u8);
    packet.push(0x00);
    packet.push(slot);
    let mut name: Vec<u8> = filename
        .bytes()
        .filter(u8::is_ascii)
        .take(12)
        .collect();
    name.resize(12, 0x00);
    packet.extend_from_slice(&name);
    packet.extend_from_slice(&[0x00, 0x00]);
    packet
}

/// Load uploaded content from a slot so it can be activated.
pub fn load_slot(slot: u8) -> Vec<u8> {
    vec![GeneralPlusCommand::LoadSlot as u8, slot]
}

/// Activate the currently loaded content.
pub fn activate() -> Vec<u8> {
    vec![GeneralPlusCommand::ActivateContent as u8]
}

/// Deactivate a slot without deleting its content.
pub fn deactivate_slot(slot: u8) -> Vec<u8> {
    vec![GeneralPlusCommand::DeactivateSlot as u8, slot]
}

/// Delete the content stored in a slot.
pub fn delete_slot(slot: u8) -> Vec<u8> {
    vec![GeneralPlusCommand::DeleteSlot as u8, slot]
}

/// Query the state of every content slot.
pub fn query_slot_states() -> Vec<u8> {
    vec![GeneralPlusCommand::GetSlotStates as u8]
}

/// Enable or disable Nordic per-packet acknowledgements.
pub fn nordic_packet_ack(enabled: bool) -> Vec<u8> {
    vec![NORDIC_PACKET_ACK, u8::from(enabled), 0x00]
}

/// Liveness probe; the device answers with its GeneralPlus firmware version.
pub fn firmware_probe() -> Vec<u8> {
    vec![GeneralPlusCommand::GetFirmwareVersion as u8]
}

// Response parsers.

/// First byte of a notification, if any.
pub fn response_id(data: &[u8]) -> Option<u8> {
    data.first().copied()
}

/// Parse a file-transfer status notification.
pub fn parse_file_transfer(data: &[u8]) -> Option<FileTransferMode> {
    if data.len() < 2 || data[0] != GeneralPlusResponse::FileTransferMode as u8 {
        return None;
    }
    FileTransferMode::from_code(data[1])
}

/// Whether a Nordic notification is a per-packet acknowledgement.
pub fn is_packet_ack(data: &[u8]) -> bool {
    data.first() == Some(&NORDIC_PACKET_ACK)
}

/// Whether a GeneralPlus notification carries sensor status.
pub fn is_sensor_status(data: &[u8]) -> bool {
    data.first() == Some(&(GeneralPlusResponse::SensorStatus as u8))
}

/// Extract the message code from a `FurbyMessage` notification.
pub fn parse_furby_message(data: &[u8]) -> Option<u8> {
    if data.len() >= 2 && data[0] == GeneralPlusResponse::FurbyMessage as u8 {
        Some(data[1])
    } else {
        None
    }
}

/// Parse a slot-states notification into per-slot states.
pub fn parse_slot_states(data: &[u8]) -> Option<Vec<SlotState>> {
    if data.first() != Some(&(GeneralPlusResponse::SlotStates as u8)) {
        return None;
    }
    data[1..].iter().map(|&b| SlotState::from_code(b)).collect()
}

/// Build a slot-states notification (used by the simulated peripheral).
pub fn build_slot_states(states: &[SlotState]) -> Vec<u8> {
    let mut packet = vec![GeneralPlusResponse::SlotStates as u8];
    packet.extend(states.iter().map(|s| s.code()));
    packet
}
