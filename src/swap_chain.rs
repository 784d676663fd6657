//! Swap texture sets
//!
//! The application renders into the current slot of a set, commits it, and
//! advances before writing again. The warp pass only ever reads the last
//! committed slot, so the two never touch the same texture as long as the
//! app rotates before it writes.

use log::{debug, info, warn};

use crate::error::{VrError, VrResult};
use crate::types::Sizei;

/// Opaque reference to a swap set; stale after `destroy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSetHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
pub struct SwapTextureSet<T> {
    textures: Vec<T>,
    current_index: usize,
    committed_index: Option<usize>,
    /// Set by `commit`, cleared by `advance_index`
    committed_since_advance: bool,
    /// Writer has wrapped back onto the slot the warp pass reads
    writing_submitted: bool,
}

impl<T> SwapTextureSet<T> {
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn committed_index(&self) -> Option<usize> {
        self.committed_index
    }

    pub fn textures(&self) -> &[T] {
        &self.textures
    }
}

struct Slot<T> {
    generation: u32,
    set: Option<SwapTextureSet<T>>,
}

/// Handle table of texture rings
pub struct SwapChainManager<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for SwapChainManager<T> {
    fn default() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }
}

impl<T> SwapChainManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a ring of `count` textures, calling `alloc` once per slot
    pub fn create_set<F>(&mut self, count: usize, mut alloc: F) -> VrResult<SwapSetHandle>
    where
        F: FnMut(usize) -> VrResult<T>,
    {
        if count < 2 {
            return Err(VrError::InvalidArgument(format!(
                "swap set needs at least 2 textures, got {}",
                count
            )));
        }
        let textures = (0..count).map(&mut alloc).collect::<VrResult<Vec<T>>>()?;
        let set = SwapTextureSet {
            textures,
            current_index: 0,
            committed_index: None,
            committed_since_advance: false,
            writing_submitted: false,
        };

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.set = Some(set);
                SwapSetHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, set: Some(set) });
                SwapSetHandle { index, generation: 0 }
            }
        };
        info!("Swap set {} created with {} textures", handle.index, count);
        Ok(handle)
    }

    pub fn get(&self, handle: SwapSetHandle) -> VrResult<&SwapTextureSet<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.set.as_ref())
            .ok_or(VrError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: SwapSetHandle) -> VrResult<&mut SwapTextureSet<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.set.as_mut())
            .ok_or(VrError::InvalidHandle)
    }

    /// Moves to the next slot; call before rendering into the set again
    pub fn advance_index(&mut self, handle: SwapSetHandle) -> VrResult<usize> {
        let set = self.get_mut(handle)?;
        set.current_index = (set.current_index + 1) % set.textures.len();
        set.committed_since_advance = false;
        set.writing_submitted = set.committed_index == Some(set.current_index);
        if set.writing_submitted {
            warn!(
                "Swap set {} advanced onto submitted slot {} before committing another; the warp still reads it",
                handle.index, set.current_index
            );
        }
        Ok(set.current_index)
    }

    pub fn current_index(&self, handle: SwapSetHandle) -> VrResult<usize> {
        Ok(self.get(handle)?.current_index)
    }

    /// Slot the application should render into
    pub fn current_texture(&self, handle: SwapSetHandle) -> VrResult<&T> {
        let set = self.get(handle)?;
        Ok(&set.textures[set.current_index])
    }

    /// Publishes the current slot to the warp pass
    pub fn commit(&mut self, handle: SwapSetHandle) -> VrResult<()> {
        let set = self.get_mut(handle)?;
        if set.committed_since_advance {
            warn!(
                "Swap set {} slot {} committed twice without advancing; the warp may read it while it is rewritten",
                handle.index, set.current_index
            );
        }
        set.committed_index = Some(set.current_index);
        set.committed_since_advance = true;
        set.writing_submitted = false;
        Ok(())
    }

    /// True when the current slot is the one the warp pass reads, i.e. the
    /// ring wrapped around without a newer commit
    pub fn writes_submitted_slot(&self, handle: SwapSetHandle) -> VrResult<bool> {
        Ok(self.get(handle)?.writing_submitted)
    }

    /// True when the current slot was committed and not yet advanced past
    pub fn needs_advance(&self, handle: SwapSetHandle) -> VrResult<bool> {
        Ok(self.get(handle)?.committed_since_advance)
    }

    /// Last committed texture, `None` until the first commit
    pub fn submitted_texture(&self, handle: SwapSetHandle) -> VrResult<Option<&T>> {
        let set = self.get(handle)?;
        Ok(set.committed_index.map(|i| &set.textures[i]))
    }

    /// Releases the set's textures and invalidates the handle
    pub fn destroy(&mut self, handle: SwapSetHandle) -> VrResult<()> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.set.is_some())
            .ok_or(VrError::InvalidHandle)?;
        slot.set = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        debug!("Swap set {} destroyed", handle.index);
        Ok(())
    }

    /// Destroys every set, used at session teardown
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.set.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.set.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One GPU texture of a swap set
#[derive(Debug)]
pub struct SwapTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub size: Sizei,
    pub format: wgpu::TextureFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapTextureDesc {
    pub size: Sizei,
    pub format: wgpu::TextureFormat,
}

/// Allocator for `create_set` backed by a wgpu device
pub fn wgpu_swap_texture(
    device: &wgpu::Device,
    desc: SwapTextureDesc,
) -> impl FnMut(usize) -> VrResult<SwapTexture> + '_ {
    move |slot| {
        if desc.size.w == 0 || desc.size.h == 0 {
            return Err(VrError::InvalidArgument(format!("swap texture size {:?}", desc.size)));
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Swap Texture {}", slot)),
            size: wgpu::Extent3d { width: desc.size.w, height: desc.size.h, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(SwapTexture { texture, view, size: desc.size, format: desc.format })
    }
}
