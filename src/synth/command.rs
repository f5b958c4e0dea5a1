//! Subprocess synthesizer binding
//!
//! Binds the `Synthesizer` capability to any engine reachable as a command.
//! The engine is invoked per segment with the model, voice, and rate on the
//! command line, receives the utterance on stdin, and must write a mono WAV
//! stream to stdout.

use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

use super::traits::{PcmAudio, SynthOutput, Synthesizer, SynthesizerFactory};
use crate::core::error::{Result, ServiceError};

/// Factory for command-backed synthesizers
pub struct CommandSynthesizerFactory {
    command: Option<String>,
    phoneme_flag: Option<String>,
    gpu: bool,
}

impl CommandSynthesizerFactory {
    /// `command` is the engine executable; `phoneme_flag` (e.g.
    /// `--phonemes`) advertises phoneme input support when set; `gpu` is
    /// forwarded to the engine as `--gpu`
    pub fn new(command: Option<String>, phoneme_flag: Option<String>, gpu: bool) -> Self {
        Self {
            command,
            phoneme_flag,
            gpu,
        }
    }
}

impl SynthesizerFactory for CommandSynthesizerFactory {
    fn create(&self, model_id: &str, voice_id: Option<&str>) -> Result<Box<dyn Synthesizer>> {
        let command = self.command.clone().ok_or_else(|| {
            ServiceError::synth("no synthesis command configured", false)
        })?;
        Ok(Box::new(CommandSynthesizer {
            command,
            phoneme_flag: self.phoneme_flag.clone(),
            gpu: self.gpu,
            model_id: model_id.to_string(),
            voice_id: voice_id.map(str::to_string),
        }))
    }
}

struct CommandSynthesizer {
    command: String,
    phoneme_flag: Option<String>,
    gpu: bool,
    model_id: String,
    voice_id: Option<String>,
}

impl Synthesizer for CommandSynthesizer {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn voice_id(&self) -> Option<&str> {
        self.voice_id.as_deref()
    }

    fn supports_phonemes(&self) -> bool {
        self.phoneme_flag.is_some()
    }

    fn synthesize(&mut self, text: &str, phonemes: Option<&str>, rate: f32) -> Result<SynthOutput> {
        let use_phonemes = phonemes.is_some() && self.supports_phonemes();
        let utterance = if use_phonemes {
            phonemes.unwrap_or(text)
        } else {
            text
        };

        let mut command = Command::new(&self.command);
        command.arg("--model").arg(&self.model_id);
        if let Some(voice) = &self.voice_id {
            command.arg("--voice").arg(voice);
        }
        command.arg("--rate").arg(format!("{:.2}", rate));
        if self.gpu {
            command.arg("--gpu");
        }
        if use_phonemes {
            if let Some(flag) = &self.phoneme_flag {
                command.arg(flag);
            }
        }
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        // A missing engine binary will not come back on retry
        let mut child = command
            .spawn()
            .map_err(|e| ServiceError::synth(format!("cannot spawn engine: {}", e), false))?;
        child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::synth("engine stdin unavailable", true))?
            .write_all(utterance.as_bytes())
            .map_err(|e| ServiceError::synth(format!("engine stdin write failed: {}", e), true))?;
        let output = child
            .wait_with_output()
            .map_err(|e| ServiceError::synth(format!("engine wait failed: {}", e), true))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::synth(
                format!("engine exited with {}: {}", output.status, stderr.trim()),
                true,
            ));
        }

        let reader = hound::WavReader::new(Cursor::new(output.stdout))
            .map_err(|e| ServiceError::synth(format!("engine produced no WAV: {}", e), true))?;
        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ServiceError::synth(format!("bad WAV samples: {}", e), true))?,
            hound::SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| ServiceError::synth(format!("bad WAV samples: {}", e), true))?
            }
        };

        Ok(SynthOutput {
            audio: PcmAudio {
                samples,
                sample_rate: spec.sample_rate,
            },
            used_phonemes: use_phonemes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_factory_errors() {
        let factory = CommandSynthesizerFactory::new(None, None, false);
        let err = match factory.create("m", None) {
            Ok(_) => panic!("expected create() to fail"),
            Err(e) => e,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_phoneme_support_follows_flag() {
        let factory =
            CommandSynthesizerFactory::new(Some("engine".to_string()), Some("--phonemes".into()), false);
        let synth = factory.create("m", None).unwrap();
        assert!(synth.supports_phonemes());

        let factory = CommandSynthesizerFactory::new(Some("engine".to_string()), None, false);
        let synth = factory.create("m", Some("p225")).unwrap();
        assert!(!synth.supports_phonemes());
        assert_eq!(synth.voice_id(), Some("p225"));
    }

    #[test]
    fn test_missing_engine_is_permanent() {
        let factory =
            CommandSynthesizerFactory::new(Some("definitely-not-an-engine".to_string()), None, false);
        let mut synth = factory.create("m", None).unwrap();
        let err = synth.synthesize("hello", None, 1.0).unwrap_err();
        assert!(!err.is_transient());
    }
}
