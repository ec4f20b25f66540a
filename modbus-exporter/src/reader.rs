//! Register reads and value decoding.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::register_map::{DataType, RegisterSpec};
use crate::transport::{Transport, TransportError};

/// Order of the two 16-bit words making up a 32-bit value.
///
/// Bytes inside each word are always big-endian, as Modbus mandates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    /// First register holds the high-order word (default)
    #[default]
    Big,
    /// First register holds the low-order word
    Little,
}

/// Decode raw register words into a numeric value.
///
/// # Panics
///
/// Panics if `words` does not hold exactly `data_type.register_count()` words.
/// The reader checks the reply length before decoding, so this only fires on a
/// programming error.
pub fn decode_words(words: &[u16], data_type: DataType, word_order: WordOrder) -> f64 {
    assert_eq!(
        words.len(),
        usize::from(data_type.register_count()),
        "{} needs {} register(s)",
        data_type,
        data_type.register_count()
    );

    match data_type {
        DataType::Int16 => f64::from(words[0] as i16),
        DataType::Uint16 => f64::from(words[0]),
        DataType::Int32 => f64::from(join_words(words, word_order) as i32),
        DataType::Uint32 => f64::from(join_words(words, word_order)),
        DataType::Float32 => f64::from(f32::from_bits(join_words(words, word_order))),
    }
}

fn join_words(words: &[u16], word_order: WordOrder) -> u32 {
    let (high, low) = match word_order {
        WordOrder::Big => (words[0], words[1]),
        WordOrder::Little => (words[1], words[0]),
    };
    (u32::from(high) << 16) | u32::from(low)
}

/// Reads one register spec from a device and decodes it.
#[derive(Debug, Clone, Copy)]
pub struct RegisterReader {
    device_id: u8,
    word_order: WordOrder,
}

impl RegisterReader {
    /// Create a reader addressing `device_id`.
    pub fn new(device_id: u8, word_order: WordOrder) -> Self {
        Self {
            device_id,
            word_order,
        }
    }

    /// The unit ID requests are addressed to.
    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// Read the registers backing `spec` and decode them.
    pub async fn read(
        &self,
        transport: &mut dyn Transport,
        spec: &RegisterSpec,
    ) -> Result<f64, TransportError> {
        let count = spec.register_count();
        let words = transport
            .read_holding_registers(spec.address, count, self.device_id)
            .await?;

        if words.len() != usize::from(count) {
            return Err(TransportError::Protocol(format!(
                "expected {} register(s) at {}, device returned {}",
                count,
                spec.address,
                words.len()
            )));
        }

        trace!(address = spec.address, ?words, "Raw registers");
        Ok(decode_words(&words, spec.data_type, self.word_order))
    }
}
