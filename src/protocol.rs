//! PDL wire constants and the command / response catalogues

/// Start of every packet, in both directions
pub const PDL_TAG: u8 = 0xAE;

/// Flow identifier used on every host to device packet
pub const HOST_FLOW_ID: u8 = 0xFF;

/// Size of the tag, length and flow header preceding each payload
pub const HEADER_LEN: usize = 6;

/// Partition names are sent as a fixed, zero padded field
pub const MAX_PART_NAME: usize = 30;

/// Byte length of the checksum field carried by END_DATA
pub const CRC_LEN: u32 = 4;

/// Fixed link rate, the PDL stages do not support renegotiation from here
pub const BAUD_RATE: usize = 115_200;

/// Chunk size used when loading the bootloader stages
pub const STAGE_CHUNK: usize = 4096;

/// Chunk size used when uploading partitions
pub const PARTITION_CHUNK: usize = 256 * 1024;

/// Default load / execute address for the first bootloader stage
pub const STAGE1_ADDR: u32 = 0x0010_0100;

/// Default load / execute address for the second bootloader stage
pub const STAGE2_ADDR: u32 = 0x8000_8000;

/// Flow identifier of a device to host packet
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Flow {
    Ack,
    Data,
    Error,
}

impl Flow {
    pub const ACK: u8 = 0xFF;
    pub const DATA: u8 = 0xBB;
    pub const ERROR: u8 = 0xEE;

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            Self::ACK => Some(Flow::Ack),
            Self::DATA => Some(Flow::Data),
            Self::ERROR => Some(Flow::Error),
            _ => None,
        }
    }
}

/// Commands understood by the PDL stages
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    Connect = 0,
    EraseFlash = 1,
    ErasePartition = 2,
    EraseAll = 3,
    /// Announce a transfer: address, length and optional partition name
    StartData = 4,
    /// One numbered chunk of the announced transfer
    MidData = 5,
    /// Close the transfer with a checksum trailer
    EndData = 6,
    /// Jump to a previously loaded stage
    ExecData = 7,
    ReadFlash = 8,
    ReadPartition = 9,
    NormalReset = 10,
    ReadChipId = 11,
    SetBaudrate = 12,
    /// Erase all flash, including the partition layout
    FormatFlash = 13,
    /// Fetch the partition layout as an ASCII string
    ReadPartitionTable = 14,
    ReadImageAttr = 15,
    GetVersion = 16,
    SetFactMode = 17,
    SetCalibMode = 18,
    SetPdlDbg = 19,
    CheckPartitionTable = 20,
    PowerOff = 21,
    /// Announce the set of partitions about to be uploaded
    ImageList = 22,
    GetSwcfgReg = 23,
    SetSwcfgReg = 24,
    GetHwcfgReg = 25,
    SetHwcfgReg = 26,
    ExitAndReload = 27,
    GetSecurity = 28,
    HwTest = 29,
    GetPdlLog = 30,
    /// Commit the uploaded partition set
    DownloadFinish = 31,
}

const COMMANDS: [Command; 32] = [
    Command::Connect,
    Command::EraseFlash,
    Command::ErasePartition,
    Command::EraseAll,
    Command::StartData,
    Command::MidData,
    Command::EndData,
    Command::ExecData,
    Command::ReadFlash,
    Command::ReadPartition,
    Command::NormalReset,
    Command::ReadChipId,
    Command::SetBaudrate,
    Command::FormatFlash,
    Command::ReadPartitionTable,
    Command::ReadImageAttr,
    Command::GetVersion,
    Command::SetFactMode,
    Command::SetCalibMode,
    Command::SetPdlDbg,
    Command::CheckPartitionTable,
    Command::PowerOff,
    Command::ImageList,
    Command::GetSwcfgReg,
    Command::SetSwcfgReg,
    Command::GetHwcfgReg,
    Command::SetHwcfgReg,
    Command::ExitAndReload,
    Command::GetSecurity,
    Command::HwTest,
    Command::GetPdlLog,
    Command::DownloadFinish,
];

impl Command {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        COMMANDS.get(code as usize).copied()
    }
}

/// Response codes reported by the PDL stages
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Response {
    Ack = 0,

    PacketError = 1,
    InvalidCmd = 2,
    UnknownCmd = 3,
    InvalidAddr = 4,
    InvalidBaudrate = 5,
    InvalidPartition = 6,
    InvalidSize = 7,
    WaitTimeout = 8,

    VerifyError = 9,
    ChecksumError = 10,
    OperationFailed = 11,
    /// DDR or NAND initialisation failure
    DeviceError = 12,
    NoMemory = 13,
    DeviceIncompatible = 14,
    HwTestError = 15,
    Md5Error = 16,

    AckAgainErase = 17,
    AckAgainFlash = 18,

    MaxRsp = 19,
}

/// Broad classes of response codes
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Category {
    Ack,
    /// Errors the device detected in what the host sent
    Transport,
    /// Failures of the operation on the device itself
    Device,
    /// The device asks for the same command to be sent again
    RetryHint,
}

const RESPONSES: [Response; 20] = [
    Response::Ack,
    Response::PacketError,
    Response::InvalidCmd,
    Response::UnknownCmd,
    Response::InvalidAddr,
    Response::InvalidBaudrate,
    Response::InvalidPartition,
    Response::InvalidSize,
    Response::WaitTimeout,
    Response::VerifyError,
    Response::ChecksumError,
    Response::OperationFailed,
    Response::DeviceError,
    Response::NoMemory,
    Response::DeviceIncompatible,
    Response::HwTestError,
    Response::Md5Error,
    Response::AckAgainErase,
    Response::AckAgainFlash,
    Response::MaxRsp,
];

impl Response {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a response code, `None` if it is outside the catalogue
    pub fn from_code(code: u32) -> Option<Self> {
        RESPONSES.get(code as usize).copied()
    }

    pub fn category(self) -> Category {
        use Response::*;

        match self {
            Ack => Category::Ack,
            PacketError | InvalidCmd | UnknownCmd | InvalidAddr | InvalidBaudrate
            | InvalidPartition | InvalidSize | WaitTimeout => Category::Transport,
            AckAgainErase | AckAgainFlash => Category::RetryHint,
            VerifyError | ChecksumError | OperationFailed | DeviceError | NoMemory
            | DeviceIncompatible | HwTestError | Md5Error | MaxRsp => Category::Device,
        }
    }

    pub fn is_retry_hint(self) -> bool {
        self.category() == Category::RetryHint
    }
}

/// Little-endian u32 at the start of `buf`, if there are enough bytes
pub(crate) fn read_u32(buf: &[u8]) -> Option<u32> {
    let mut b = [0u8; 4];
    b.copy_from_slice(buf.get(..4)?);
    Some(u32::from_le_bytes(b))
}
