//! Binary serialization of [`Series`] for the artifact cache.
//!
//! Layout (little-endian): three `u64` counts (columns, rows, stride), a
//! `0x0A` separator, the space-delimited column names, another `0x0A`, then
//! per row one `i64` timestamp followed by `data_stride` `f32` cells. Tags
//! and the measurement name are not part of the encoding.

use crate::{FormatSnafu, IoSnafu, Result, Series};
use snafu::{ensure, ResultExt};
use std::io::{Read, Write};

impl Series {
    /// Serialize the frame into `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.columns.len() as u64).to_le_bytes())
            .context(IoSnafu)?;
        w.write_all(&(self.num as u64).to_le_bytes()).context(IoSnafu)?;
        w.write_all(&(self.data_stride as u64).to_le_bytes())
            .context(IoSnafu)?;
        w.write_all(b"\n").context(IoSnafu)?;

        for col in &self.columns {
            w.write_all(col.as_bytes()).context(IoSnafu)?;
            w.write_all(b" ").context(IoSnafu)?;
        }
        w.write_all(b"\n").context(IoSnafu)?;

        for i in 0..self.num {
            w.write_all(&self.time[i].to_le_bytes()).context(IoSnafu)?;
            for ci in 0..self.data_stride {
                w.write_all(&self.data[i * self.data_stride + ci].to_le_bytes())
                    .context(IoSnafu)?;
            }
        }

        Ok(())
    }

    /// Deserialize a frame previously written by [`Self::write_to`].
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let cn = read_u64(r)? as usize;
        let num = read_u64(r)? as usize;
        let data_stride = read_u64(r)? as usize;

        ensure!(
            read_byte(r)? == b'\n',
            FormatSnafu {
                what: "missing header separator",
            }
        );

        let mut columns = Vec::with_capacity(cn);
        for _ in 0..cn {
            columns.push(read_token(r)?);
        }

        ensure!(
            read_byte(r)? == b'\n',
            FormatSnafu {
                what: "missing column separator",
            }
        );

        let mut fr = Self {
            columns,
            num,
            data_stride,
            time: Vec::with_capacity(num),
            data: Vec::with_capacity(num * data_stride),
            ..Default::default()
        };

        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];
        for _ in 0..num {
            r.read_exact(&mut buf8).context(IoSnafu)?;
            fr.time.push(i64::from_le_bytes(buf8));
            for _ in 0..data_stride {
                r.read_exact(&mut buf4).context(IoSnafu)?;
                fr.data.push(f32::from_le_bytes(buf4));
            }
        }

        fr.check_num()?;

        Ok(fr)
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context(IoSnafu)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_byte<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).context(IoSnafu)?;
    Ok(buf[0])
}

/// Read one space-terminated column name.
fn read_token<R: Read>(r: &mut R) -> Result<String> {
    let mut token = Vec::new();
    loop {
        let b = read_byte(r)?;
        if b == b' ' {
            break;
        }
        ensure!(
            b != b'\n',
            FormatSnafu {
                what: "truncated column name",
            }
        );
        token.push(b);
    }
    String::from_utf8(token).map_err(|_| crate::Error::Format {
        what: "column name is not utf-8",
    })
}
