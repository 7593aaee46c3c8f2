//! Point-in-time reports of the live allocations.
//!
//! Records come out in ledger order, which is not sorted by address. Nothing
//! here mutates anything, so dumping twice with no operations in between
//! produces the same bytes.

use std::io::{self, Write};

use serde::Serialize;

use crate::storage::MemoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    /// One line per allocation, caller frames indented underneath
    #[default]
    Text,
    Json,
}

#[derive(Serialize)]
struct JsonDump<'a> {
    live_allocations: usize,
    total_bytes: u64,
    allocations: &'a [MemoryRecord],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Dumper {
    format: DumpFormat,
}

impl Dumper {
    pub const fn new(format: DumpFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> DumpFormat {
        self.format
    }

    pub fn write<W>(&self, records: &[MemoryRecord], mut sink: W) -> io::Result<()>
    where
        W: Write,
    {
        // Sizes can come straight from host arguments, so this may saturate
        let total_bytes = records
            .iter()
            .map(|r| r.size)
            .fold(0u64, u64::saturating_add);
        match self.format {
            DumpFormat::Text => {
                writeln!(
                    sink,
                    "{} live allocation(s), {total_bytes} byte(s)",
                    records.len()
                )?;
                for record in records {
                    write_text_record(&mut sink, record)?;
                }
            }
            DumpFormat::Json => {
                let dump = JsonDump {
                    live_allocations: records.len(),
                    total_bytes,
                    allocations: records,
                };
                serde_json::to_writer_pretty(&mut sink, &dump)?;
                writeln!(sink)?;
            }
        }
        sink.flush()
    }

    pub fn render(&self, records: &[MemoryRecord]) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec only fails if serialization does, and ours can't
        let _ = self.write(records, &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn write_text_record<W>(sink: &mut W, record: &MemoryRecord) -> io::Result<()>
where
    W: Write,
{
    write!(sink, "{:#018x} {:>10} byte(s)", record.address, record.size)?;
    let Some(caller) = &record.caller else {
        return writeln!(sink);
    };
    writeln!(sink, " [thread {}]", caller.thread)?;
    for frame in caller.trail.frames() {
        writeln!(sink, "    at {frame}")?;
    }
    Ok(())
}
