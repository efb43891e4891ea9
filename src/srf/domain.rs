//! Comandos remotos seguros (SRF).
//!
//! El sobre es `header.payload.firma`, cada parte en base64. Sólo el payload se
//! interpreta acá; la firma la verifica la nube al recibir la respuesta.


use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use crate::config::srf;


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrfCommand {
    WhereIsMyDog { request_id: String },
    FindMyDog { enable: bool, duration_minutes: u32 },
    Reboot { delay: Duration },
    CheckFota,
    GpsEnable { period_secs: u32 },
    FactoryReset,
    Noop,
}


#[derive(Debug, Error)]
pub enum SrfError {
    #[error("falta el campo SM")]
    MissingEnvelope,
    #[error("sobre SRF mal formado")]
    MalformedEnvelope,
    #[error("base64 inválido")]
    Base64,
    #[error("payload SRF inválido: {0}")]
    Json(#[from] serde_json::Error),
    #[error("nonce inválido")]
    NonceMismatch,
    #[error("audiencia {0} no corresponde a este dispositivo")]
    AudienceMismatch(String),
    #[error("comando expirado en {expires_at}, ahora {now}")]
    Expired { expires_at: i64, now: i64 },
    #[error("comando desconocido {0}")]
    UnknownCommand(u8),
    #[error("parámetro inválido para el comando {0}")]
    BadParameter(&'static str),
}


impl SrfError {
    /// Texto para la respuesta `ERROR`.
    pub fn response_text(&self) -> &'static str {
        match self {
            SrfError::NonceMismatch => "Invalid nonce",
            SrfError::AudienceMismatch(_) => "Invalid audience",
            SrfError::Expired { .. } => "Command expired",
            SrfError::UnknownCommand(_) => "Unknown command",
            SrfError::BadParameter(_) => "Invalid parameter",
            _ => "Malformed command",
        }
    }
}


#[derive(Debug, Deserialize)]
struct SrfClaims {
    rid: String,
    aud: String,
    exp: i64,
    nonce: String,
    cmd: u8,
    #[serde(default)]
    p1: Value,
    #[serde(default)]
    p2: Value,
}


/// Payload decodificado. El comando se interpreta recién después de validar.
#[derive(Debug)]
pub struct SrfRequest {
    pub request_id: String,
    pub audience: String,
    pub expires_at: i64,
    pub nonce: String,
    command: Result<SrfCommand, SrfError>,
}


impl SrfRequest {
    /// Decodifica el campo `SM` (`header.payload.firma`).
    pub fn decode(sm: &str) -> Result<Self, SrfError> {
        let mut parts = sm.split('.');
        let (Some(header), Some(payload), Some(_signature), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(SrfError::MalformedEnvelope);
        };
        decode_b64(header)?;
        let claims: SrfClaims = serde_json::from_slice(&decode_b64(payload)?)?;
        let command = parse_command(claims.cmd, &claims.p1, &claims.p2);
        Ok(Self {
            request_id: claims.rid,
            audience: claims.aud,
            expires_at: claims.exp,
            nonce: claims.nonce,
            command,
        })
    }

    /// Nonce, después audiencia, después expiración. Sin efectos secundarios.
    pub fn validate(&self, nonce: u64, serial: &str, now: i64) -> Result<(), SrfError> {
        if nonce == 0 || self.nonce.trim() != nonce.to_string() {
            return Err(SrfError::NonceMismatch);
        }
        let target = self.audience.rsplit_once('_').map(|(_, s)| s).unwrap_or(&self.audience);
        if target != serial {
            return Err(SrfError::AudienceMismatch(self.audience.clone()));
        }
        if self.expires_at < now {
            return Err(SrfError::Expired { expires_at: self.expires_at, now });
        }
        Ok(())
    }

    pub fn into_command(self) -> Result<SrfCommand, SrfError> {
        self.command
    }
}


fn decode_b64(part: &str) -> Result<Vec<u8>, SrfError> {
    let part = part.trim();
    [URL_SAFE_NO_PAD, URL_SAFE, STANDARD, STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(part).ok())
        .ok_or(SrfError::Base64)
}


fn param_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}


fn parse_command(code: u8, p1: &Value, p2: &Value) -> Result<SrfCommand, SrfError> {
    match code {
        0 => Ok(SrfCommand::Noop),
        1 => match p1 {
            Value::String(rid) if !rid.is_empty() => Ok(SrfCommand::WhereIsMyDog { request_id: rid.clone() }),
            _ => Err(SrfError::BadParameter("WHERE_IS_MY_DOG")),
        },
        2 => {
            let state = param_u32(p1).ok_or(SrfError::BadParameter("FIND_MY_DOG"))?;
            Ok(SrfCommand::FindMyDog { enable: state != 0, duration_minutes: param_u32(p2).unwrap_or(0) })
        }
        3 => Ok(SrfCommand::Reboot { delay: clamp_reboot_delay(p1.as_i64().or_else(|| param_u32(p1).map(i64::from)).unwrap_or(0)) }),
        4 => Ok(SrfCommand::CheckFota),
        5 => Ok(SrfCommand::GpsEnable { period_secs: param_u32(p1).ok_or(SrfError::BadParameter("GPS_ENABLE"))? }),
        6 => Ok(SrfCommand::FactoryReset),
        other => Err(SrfError::UnknownCommand(other)),
    }
}


/// Demora de reinicio acotada a [10 s, 3600 s].
pub fn clamp_reboot_delay(secs: i64) -> Duration {
    Duration::from_secs(secs.clamp(srf::REBOOT_MIN_SECS, srf::REBOOT_MAX_SECS) as u64)
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrfReply {
    Ok(String),
    Error(String),
}


impl SrfReply {
    pub fn status(&self) -> &'static str {
        match self {
            SrfReply::Ok(_) => "OK",
            SrfReply::Error(_) => "ERROR",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            SrfReply::Ok(t) | SrfReply::Error(t) => t,
        }
    }
}


/// Nonce vigente. Cero significa "todavía no generado".
#[derive(Debug, Default)]
pub struct SrfState {
    pub nonce: u64,
}


impl SrfState {
    pub fn regenerate(&mut self) -> u64 {
        let mut nonce = 0;
        while nonce == 0 {
            nonce = rand::random::<u64>();
        }
        self.nonce = nonce;
        nonce
    }
}


/// Arma un sobre SRF. Usado por las pruebas.
#[cfg(test)]
pub fn encode_envelope(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2ln")
}
