use std::path::Path;

use burn::tensor::{Data, Shape};
use tokenizers::Tokenizer;

use crate::error::{ChartError, Result};

pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "</s>";

#[derive(Clone, Debug)]
pub struct SpecialTokens {
    pub pad_id: u32,
    pub eos_id: u32,
}

/// Tokenizes chart tables into label ids and turns generated ids back into
/// text. Wraps a Hugging Face `tokenizer.json`.
#[derive(Clone, Debug)]
pub struct TextProcessor {
    tokenizer: Tokenizer,
    pub special_tokens: SpecialTokens,
}

impl TextProcessor {
    /// Loads `path` directly, or `path/tokenizer.json` when `path` is a
    /// directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };
        if !file.is_file() {
            return Err(ChartError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("tokenizer file {} does not exist", file.display()),
            )));
        }
        let tokenizer =
            Tokenizer::from_file(&file).map_err(|err| ChartError::Tokenizer(err.to_string()))?;

        Self::new(tokenizer)
    }

    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(PAD_TOKEN)
            .ok_or(ChartError::MissingSpecialToken(PAD_TOKEN))?;
        let eos_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .ok_or(ChartError::MissingSpecialToken(EOS_TOKEN))?;

        Ok(Self {
            tokenizer,
            special_tokens: SpecialTokens { pad_id, eos_id },
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Token ids of `text` truncated so that, with the trailing EOS, the
    /// result holds at most `max_length` ids.
    pub fn encode_single(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|err| ChartError::Tokenizer(err.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(max_length.saturating_sub(1));
        ids.push(self.special_tokens.eos_id);

        Ok(ids)
    }

    /// Encodes every text and pads with the PAD id up to the longest row of
    /// this batch.
    pub fn encode_to_1d_vec_with_shape(
        &self,
        texts: &[String],
        max_length: usize,
    ) -> Result<(Vec<u32>, [usize; 2])> {
        let encoded = texts
            .iter()
            .map(|text| self.encode_single(text, max_length))
            .collect::<Result<Vec<_>>>()?;
        let longest = encoded.iter().map(Vec::len).max().unwrap_or(0);

        let mut res = Vec::with_capacity(encoded.len() * longest);
        for ids in &encoded {
            res.extend_from_slice(ids);
            res.extend((ids.len()..longest).map(|_| self.special_tokens.pad_id));
        }

        Ok((res, [encoded.len(), longest]))
    }

    pub fn encode_to_tensor_data(&self, texts: &[String], max_length: usize) -> Result<Data<i64, 2>> {
        let (ids, shape) = self.encode_to_1d_vec_with_shape(texts, max_length)?;
        let ids = ids.into_iter().map(|id| id as i64).collect();

        Ok(Data::new(ids, Shape::new(shape)))
    }

    /// Decodes one generated row. Everything after the first EOS is dropped
    /// and special tokens are skipped.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let end = ids
            .iter()
            .position(|&id| id == self.special_tokens.eos_id)
            .unwrap_or(ids.len());

        self.tokenizer
            .decode(&ids[..end], true)
            .map_err(|err| ChartError::Tokenizer(err.to_string()))
    }

    pub fn batch_decode(&self, rows: &[Vec<u32>]) -> Result<Vec<String>> {
        rows.iter().map(|ids| self.decode(ids)).collect()
    }
}
