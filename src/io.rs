// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cursor over a USB configuration descriptor blob.
//!
//! A configuration descriptor set is a sequence of self-describing records, each starting with
//! its own length and type. [`DescriptorIter`] walks this sequence and hands out typed copies of
//! the current record, but only after checking that the record is long enough for the requested
//! type and that the record fits entirely in the remaining bytes. Nothing is ever reinterpreted
//! in place: typed reads go through [`zerocopy::FromBytes`], which copies out of the checked
//! range.

use std::mem::size_of;

use zerocopy::FromBytes;

use crate::protocol::CsDescriptorHeader;
use crate::protocol::DescriptorHeader;
use crate::protocol::DescriptorType;
use crate::protocol::InterfaceDescriptor;

/// Read-only cursor over a descriptor blob.
#[derive(Debug, Clone)]
pub struct DescriptorIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the bytes of the current descriptor, as delimited by its declared length.
    ///
    /// Returns `None` if the cursor is exhausted, or if the current descriptor declares a length
    /// that is either shorter than a descriptor header or longer than the remaining data. Such a
    /// descriptor cannot be skipped safely and ends the iteration.
    pub fn current(&self) -> Option<&'a [u8]> {
        let remaining = self.data.get(self.offset..)?;
        let header = DescriptorHeader::read_from_prefix(remaining)?;
        let len = header.bLength as usize;
        if len < size_of::<DescriptorHeader>() || len > remaining.len() {
            return None;
        }

        Some(&remaining[..len])
    }

    /// Returns the header of the current descriptor without consuming it.
    pub fn peek(&self) -> Option<DescriptorHeader> {
        self.current().and_then(DescriptorHeader::read_from_prefix)
    }

    /// Returns the type of the current descriptor, or `None` if the cursor is exhausted or the
    /// type is not one this crate knows about.
    pub fn peek_type(&self) -> Option<DescriptorType> {
        self.peek()
            .and_then(|header| DescriptorType::n(header.bDescriptorType))
    }

    /// Returns the subtype of the current descriptor if it is a class-specific interface
    /// descriptor.
    pub fn peek_cs_subtype(&self) -> Option<u8> {
        if self.peek_type() != Some(DescriptorType::CsInterface) {
            return None;
        }
        self.read::<CsDescriptorHeader>()
            .map(|header| header.bDescriptorSubtype)
    }

    /// Returns the current descriptor as a standard interface descriptor, if it is one.
    pub fn peek_interface(&self) -> Option<InterfaceDescriptor> {
        if self.peek_type() != Some(DescriptorType::Interface) {
            return None;
        }
        self.read()
    }

    /// Returns a copy of the current descriptor as a `T`.
    ///
    /// Fails if the declared length of the current descriptor is smaller than `T`. Trailing bytes
    /// of the descriptor beyond the size of `T` are ignored.
    pub fn read<T: FromBytes>(&self) -> Option<T> {
        let bytes = self.current()?;
        if bytes.len() < size_of::<T>() {
            return None;
        }
        T::read_from_prefix(bytes)
    }

    /// Moves to the next descriptor. Returns `false` if there was no valid descriptor to move
    /// past, in which case the cursor is now exhausted.
    pub fn advance(&mut self) -> bool {
        match self.current() {
            Some(bytes) => {
                self.offset += bytes.len();
                true
            }
            None => {
                self.offset = self.data.len();
                false
            }
        }
    }

    /// Advances until the current descriptor satisfies `predicate`, without consuming it.
    ///
    /// Returns `false` if the cursor got exhausted before that.
    pub fn skip_until<F>(&mut self, mut predicate: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        while self.current().is_some() {
            if predicate(self) {
                return true;
            }
            self.advance();
        }

        false
    }

    /// Offset of the current descriptor in the blob.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current()?;
        self.advance();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::DescriptorIter;
    use crate::protocol::DescriptorType;
    use crate::protocol::EndpointDescriptor;
    use crate::protocol::InterfaceDescriptor;

    const BLOB: [u8; 16] = [
        // Interface descriptor.
        9, 0x04, 1, 0, 1, 0x0e, 0x02, 0, 0, //
        // Endpoint descriptor.
        7, 0x05, 0x81, 0x05, 0x00, 0x04, 1,
    ];

    #[test]
    fn walk_descriptors() {
        let mut iter = DescriptorIter::new(&BLOB);
        assert_eq!(iter.peek_type(), Some(DescriptorType::Interface));
        let interface = iter.peek_interface().unwrap();
        assert_eq!(interface.bInterfaceNumber, 1);
        assert_eq!(interface.bNumEndpoints, 1);
        // The interface descriptor is too short to be read as anything larger.
        assert!(iter.read::<[u8; 10]>().is_none());

        assert!(iter.advance());
        assert_eq!(iter.offset(), 9);
        let endpoint = iter.read::<EndpointDescriptor>().unwrap();
        assert_eq!(endpoint.bEndpointAddress, 0x81);
        assert_eq!(endpoint.wMaxPacketSize.get(), 0x400);
        assert!(iter.peek_interface().is_none());

        assert!(iter.advance());
        assert!(iter.peek().is_none());
        assert!(!iter.advance());
    }

    #[test]
    fn truncated_descriptor_ends_iteration() {
        let mut blob = BLOB.to_vec();
        // Endpoint declares more bytes than available.
        blob[9] = 12;
        let iter = DescriptorIter::new(&blob);
        assert_eq!(iter.count(), 1);

        let mut iter = DescriptorIter::new(&blob);
        assert!(iter.advance());
        assert!(iter.read::<EndpointDescriptor>().is_none());
    }

    #[test]
    fn zero_length_descriptor_ends_iteration() {
        let blob = [0u8, 0x04, 9, 0x04];
        let mut iter = DescriptorIter::new(&blob);
        assert!(iter.peek().is_none());
        assert!(!iter.advance());
        assert!(!iter.skip_until(|_| true));
    }

    #[test]
    fn skip_until_interface() {
        let mut blob = vec![3u8, 0x24, 0x01];
        blob.extend_from_slice(&BLOB);
        let mut iter = DescriptorIter::new(&blob);
        assert_eq!(iter.peek_cs_subtype(), Some(0x01));
        assert!(iter.skip_until(|iter| iter.peek_interface().is_some()));
        assert_eq!(iter.offset(), 3);
        let interface: InterfaceDescriptor = iter.read().unwrap();
        assert_eq!(interface.bInterfaceClass, 0x0e);
    }
}
