/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::Arc;

use log::{error, trace};

use crate::{
    client::Client,
    device::Device,
    error::IonResult,
    types::{AllocationFlags, Descriptor, HandleId},
};

/// One open of the allocation service by a process.
///
/// Every handle a session returns carries a user reference. Dropping the
/// session destroys its client and with it every handle it still has.
#[derive(Debug)]
pub struct Session {
    client: Client,
}

impl Session {
    /// Opens a session whose client is named after the calling process
    pub fn open(device: &Arc<Device>) -> IonResult<Self> {
        let name = std::process::id().to_string();
        let client = device.create_client(&name)?;
        trace!("opened session {}", client);
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn alloc(&self, len: usize, align: usize, heap_mask: u32, flags: AllocationFlags) -> IonResult<HandleId> {
        let handle = self
            .client
            .alloc_handle(len, align, heap_mask, flags, true)?;

        // the extra reference taken by the allocation moves to the user,
        // the other one is dropped once the handle is handed out
        let passed = self.client.pass_to_user(handle);
        self.client.handle_put(handle)?;
        passed?;
        Ok(handle)
    }

    /// Drops one user reference, the handle is destroyed with the last one
    pub fn free(&self, handle: HandleId) -> IonResult<()> {
        self.client.user_free(handle)
    }

    /// Exports a handle as a descriptor
    pub fn share(&self, handle: HandleId) -> IonResult<Descriptor> {
        self.client.share_descriptor(handle)
    }

    pub fn import(&self, descriptor: Descriptor) -> IonResult<HandleId> {
        let handle = self.client.import(descriptor).map_err(|err| {
            error!("import of descriptor {} failed: {}", descriptor, err);
            err
        })?;
        self.client.pass_to_user(handle)?;
        Ok(handle)
    }

    pub fn sync(&self, descriptor: Descriptor) -> IonResult<()> {
        self.client.device().sync_for_device(descriptor)
    }
}
