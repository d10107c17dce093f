//! Фонемный алфавит.
//!
//! Закрытое множество символов с выделенным символом конца последовательности.

use std::collections::HashMap;
use std::fmt;

use crate::error::{AsrError, AsrResult};

/// 61 фон TIMIT в алфавитном порядке.
const TIMIT_PHONES: [&str; 61] = [
    "aa", "ae", "ah", "ao", "aw", "ax", "ax-h", "axr", "ay", "b", "bcl", "ch", "d", "dcl", "dh",
    "dx", "eh", "el", "em", "en", "eng", "epi", "er", "ey", "f", "g", "gcl", "h#", "hh", "hv",
    "ih", "ix", "iy", "jh", "k", "kcl", "l", "m", "n", "ng", "nx", "ow", "oy", "p", "pau", "pcl",
    "q", "r", "s", "sh", "t", "tcl", "th", "uh", "uw", "ux", "v", "w", "y", "z", "zh",
];

/// Символ тишины на краях высказываний TIMIT, он же конец последовательности.
const TIMIT_EOS: &str = "h#";

/// Алфавит фонем.
#[derive(Debug, Clone)]
pub struct PhonemeAlphabet {
    symbols: Vec<String>,
    index: HashMap<String, u32>,
    eos: u32,
}

impl PhonemeAlphabet {
    /// Построить алфавит из списка символов.
    pub fn new(symbols: Vec<String>, eos: &str) -> AsrResult<Self> {
        let mut index = HashMap::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            if index.insert(symbol.clone(), i as u32).is_some() {
                return Err(AsrError::Config(format!("duplicate phoneme '{symbol}'")));
            }
        }
        let eos = *index
            .get(eos)
            .ok_or_else(|| AsrError::Config(format!("end-of-sequence '{eos}' not in alphabet")))?;
        Ok(Self {
            symbols,
            index,
            eos,
        })
    }

    /// Фоны TIMIT, `h#` — конец последовательности.
    pub fn timit() -> Self {
        let symbols: Vec<String> = TIMIT_PHONES.iter().map(|s| s.to_string()).collect();
        let index = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        let eos = TIMIT_PHONES
            .iter()
            .position(|s| *s == TIMIT_EOS)
            .unwrap_or_default() as u32;
        Self {
            symbols,
            index,
            eos,
        }
    }

    /// Размер алфавита.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Индекс символа конца последовательности.
    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn symbol(&self, index: u32) -> Option<&str> {
        self.symbols.get(index as usize).map(String::as_str)
    }

    /// Закодировать фонемы; конец последовательности дописывается, если его нет.
    ///
    /// Ведущий `h#` отбрасывается: символ конца встречается только в конце.
    pub fn encode<S: AsRef<str>>(&self, phonemes: &[S]) -> AsrResult<Vec<u32>> {
        let mut labels = Vec::with_capacity(phonemes.len() + 1);
        for phoneme in phonemes {
            let phoneme = phoneme.as_ref();
            let label = *self
                .index
                .get(phoneme)
                .ok_or_else(|| AsrError::Data(format!("unknown phoneme '{phoneme}'")))?;
            if label == self.eos && labels.is_empty() {
                continue;
            }
            labels.push(label);
        }
        if let Some(pos) = labels.iter().position(|&l| l == self.eos) {
            if pos + 1 != labels.len() {
                return Err(AsrError::Data(
                    "end-of-sequence symbol in the middle of a transcription".into(),
                ));
            }
        } else {
            labels.push(self.eos);
        }
        Ok(labels)
    }

    /// Декодировать индексы в строку через пробел; неизвестные индексы — `<?>`.
    pub fn decode(&self, labels: &[u32]) -> String {
        labels
            .iter()
            .map(|&l| self.symbol(l).unwrap_or("<?>"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for PhonemeAlphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} phonemes (eos = {})", self.len(), self.symbols[self.eos as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timit_alphabet() {
        let alphabet = PhonemeAlphabet::timit();
        assert_eq!(alphabet.len(), 61);
        assert_eq!(alphabet.symbol(alphabet.eos()), Some("h#"));
    }

    #[test]
    fn test_encode_appends_eos() {
        let alphabet = PhonemeAlphabet::timit();
        let labels = alphabet.encode(&["h#", "sh", "iy", "h#"]).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(*labels.last().unwrap(), alphabet.eos());
        assert_eq!(alphabet.decode(&labels), "sh iy h#");

        let labels = alphabet.encode(&["sh", "iy"]).unwrap();
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_encode_rejects_unknown_and_inner_eos() {
        let alphabet = PhonemeAlphabet::timit();
        assert!(matches!(alphabet.encode(&["xx"]), Err(AsrError::Data(_))));
        assert!(matches!(
            alphabet.encode(&["sh", "h#", "iy"]),
            Err(AsrError::Data(_))
        ));
    }

    #[test]
    fn test_custom_alphabet() {
        let alphabet =
            PhonemeAlphabet::new(vec!["a".into(), "b".into(), "</s>".into()], "</s>").unwrap();
        assert_eq!(alphabet.eos(), 2);
        assert!(PhonemeAlphabet::new(vec!["a".into(), "a".into()], "a").is_err());
        assert!(PhonemeAlphabet::new(vec!["a".into()], "z").is_err());
    }
}
