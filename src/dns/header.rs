use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

use crate::error::{GateError, Result};

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// The fixed 12-byte DNS message header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

fn truncated(_: std::io::Error) -> GateError {
    GateError::PacketFormat("truncated header".to_string())
}

impl DnsHeader {
    /// Parse the header from the front of a message.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(GateError::PacketFormat(format!(
                "message too short for header: {} bytes",
                buf.len()
            )));
        }

        let mut reader = BitReader::endian(&buf[..HEADER_LEN], BigEndian);
        let mut header = DnsHeader::default();
        header.id = reader.read_var::<u16>(16).map_err(truncated)?;
        header.qr = reader.read_var::<u8>(1).map_err(truncated)? == 1;
        header.opcode = reader.read_var::<u8>(4).map_err(truncated)?;
        header.aa = reader.read_var::<u8>(1).map_err(truncated)? == 1;
        header.tc = reader.read_var::<u8>(1).map_err(truncated)? == 1;
        header.rd = reader.read_var::<u8>(1).map_err(truncated)? == 1;
        header.ra = reader.read_var::<u8>(1).map_err(truncated)? == 1;
        header.z = reader.read_var::<u8>(3).map_err(truncated)?;
        header.rcode = reader.read_var::<u8>(4).map_err(truncated)?;
        header.qdcount = reader.read_var::<u16>(16).map_err(truncated)?;
        header.ancount = reader.read_var::<u16>(16).map_err(truncated)?;
        header.nscount = reader.read_var::<u16>(16).map_err(truncated)?;
        header.arcount = reader.read_var::<u16>(16).map_err(truncated)?;
        Ok(header)
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut writer = BitWriter::endian(&mut *out, BigEndian);
        writer.write_var::<u16>(16, self.id).map_err(truncated)?;
        writer
            .write_var::<u8>(1, self.qr as u8)
            .map_err(truncated)?;
        writer.write_var::<u8>(4, self.opcode).map_err(truncated)?;
        writer
            .write_var::<u8>(1, self.aa as u8)
            .map_err(truncated)?;
        writer
            .write_var::<u8>(1, self.tc as u8)
            .map_err(truncated)?;
        writer
            .write_var::<u8>(1, self.rd as u8)
            .map_err(truncated)?;
        writer
            .write_var::<u8>(1, self.ra as u8)
            .map_err(truncated)?;
        writer.write_var::<u8>(3, self.z).map_err(truncated)?;
        writer.write_var::<u8>(4, self.rcode).map_err(truncated)?;
        writer
            .write_var::<u16>(16, self.qdcount)
            .map_err(truncated)?;
        writer
            .write_var::<u16>(16, self.ancount)
            .map_err(truncated)?;
        writer
            .write_var::<u16>(16, self.nscount)
            .map_err(truncated)?;
        writer
            .write_var::<u16>(16, self.arcount)
            .map_err(truncated)?;
        Ok(())
    }
}
