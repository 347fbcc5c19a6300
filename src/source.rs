// src/source.rs
//
// Origen de bytes de la imagen. El núcleo sólo necesita "leer N bytes en el
// offset absoluto O"; abrir el archivo o el dispositivo es cosa del llamador.

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;

use crate::error::DecodeError;
use crate::layout::block_offset;

/// Fuente de bytes direccionable de solo lectura.
///
/// `read_at` puede devolver menos bytes de los pedidos; 0 significa fin de la
/// fuente. Ninguna implementación debe modificar la fuente.
pub trait ByteSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl ByteSource for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl ByteSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ByteSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.as_slice().read_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Lee exactamente `len` bytes desde `offset` a un buffer nuevo.
///
/// Un fin de fuente antes de completar devuelve `TruncatedRead` con la
/// cantidad obtenida; `Interrupted` se vuelve a intentar, cualquier otro error
/// de E/S se propaga tal cual.
pub fn read_exact_at<S: ByteSource + ?Sized>(
    source: &S,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, DecodeError> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;

    while filled < len {
        match source.read_at(offset + filled as u64, &mut buf[filled..]) {
            Ok(0) => {
                return Err(DecodeError::TruncatedRead {
                    offset,
                    needed: len,
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(DecodeError::Io(e)),
        }
    }

    Ok(buf)
}

/// Lee el bloque `block_id` completo. Único punto donde se leen bloques.
pub fn read_block<S: ByteSource + ?Sized>(
    source: &S,
    block_size: u32,
    block_id: u32,
) -> Result<Vec<u8>, DecodeError> {
    read_exact_at(source, block_offset(block_size, block_id), block_size as usize)
}
