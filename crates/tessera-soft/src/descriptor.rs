//! Descriptor sets, pipelines and host compute kernels.

use crate::resource::{byte_range, BufferInner, ImageInner, StructureInner, TargetImageInner};
use crate::structure::{Contents, Hit, Ray};
use bytemuck::Pod;
use std::fmt;
use std::sync::Arc;
use tessera_core::{DescriptorBinding, DescriptorType, Error, Result, SamplerFilter};

/// A host compute kernel, invoked once per dispatch.
pub type Kernel = Arc<dyn Fn(&Dispatch<'_>) -> Result<()> + Send + Sync>;

#[derive(Debug)]
pub struct SoftDescriptorSetLayout {
    pub(crate) bindings: Vec<DescriptorBinding>,
}

#[derive(Debug)]
pub struct SoftPipelineLayout {
    pub(crate) set_layouts: Vec<Vec<DescriptorBinding>>,
}

pub struct SoftComputePipeline {
    pub(crate) name: String,
    pub(crate) kernel: Kernel,
    pub(crate) set_count: usize,
}

impl fmt::Debug for SoftComputePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftComputePipeline")
            .field("name", &self.name)
            .field("set_count", &self.set_count)
            .finish_non_exhaustive()
    }
}

/// A resource written into a descriptor.
#[derive(Clone)]
pub(crate) enum Bound {
    Uniform { buffer: Arc<BufferInner>, range: u64 },
    ReadOnlyStorage(Arc<BufferInner>),
    Storage(Arc<BufferInner>),
    SampledImage(Arc<ImageInner>),
    SampledTarget(Arc<TargetImageInner>),
    StorageImage(Arc<TargetImageInner>),
    Sampler(SamplerFilter),
    Tlas(Arc<StructureInner>),
}

impl Bound {
    pub fn assert_graphics_readable(&self) {
        match self {
            Self::Uniform { buffer, .. }
            | Self::ReadOnlyStorage(buffer)
            | Self::Storage(buffer) => buffer.ownership.assert_graphics_readable("buffer"),
            Self::SampledImage(image) => image.ownership.assert_graphics_readable("sampled image"),
            Self::Tlas(tlas) => tlas.ownership.assert_graphics_readable("TLAS"),
            // Target images never leave the graphics queue.
            Self::SampledTarget(_) | Self::StorageImage(_) | Self::Sampler(_) => {}
        }
    }

    fn variant(&self) -> &'static str {
        match self {
            Self::Uniform { .. } => "uniform buffer",
            Self::ReadOnlyStorage(_) => "read-only storage buffer",
            Self::Storage(_) => "storage buffer",
            Self::SampledImage(_) => "sampled image",
            Self::SampledTarget(_) => "sampled target image",
            Self::StorageImage(_) => "storage image",
            Self::Sampler(_) => "sampler",
            Self::Tlas(_) => "TLAS",
        }
    }
}

#[derive(Clone)]
pub(crate) struct BindingSlots {
    pub layout: DescriptorBinding,
    pub elements: Vec<Option<Bound>>,
}

pub struct SoftDescriptorSet {
    pub(crate) bindings: Vec<BindingSlots>,
}

impl SoftDescriptorSet {
    pub(crate) fn new(layout: &SoftDescriptorSetLayout) -> Self {
        let mut layouts = layout.bindings.clone();
        layouts.sort_by_key(|b| b.binding);
        Self {
            bindings: layouts
                .into_iter()
                .map(|layout| BindingSlots {
                    layout,
                    elements: vec![None; layout.count as usize],
                })
                .collect(),
        }
    }

    pub(crate) fn write(
        &mut self,
        binding: u32,
        first_element: u32,
        descriptor_type: DescriptorType,
        resources: Vec<Bound>,
    ) {
        let Some(slots) = self.bindings.iter_mut().find(|s| s.layout.binding == binding) else {
            debug_assert!(false, "descriptor set has no binding {binding}");
            return;
        };
        debug_assert_eq!(
            slots.layout.descriptor_type, descriptor_type,
            "binding {binding} written with the wrong descriptor type"
        );
        let first = first_element as usize;
        debug_assert!(
            first + resources.len() <= slots.elements.len(),
            "write of {} descriptors at {first} overflows binding {binding} of {} elements",
            resources.len(),
            slots.elements.len()
        );
        for (slot, resource) in slots.elements.iter_mut().skip(first).zip(resources) {
            *slot = Some(resource);
        }
    }

    /// Number of dynamic uniform descriptors, consuming one dynamic offset each.
    pub(crate) fn dynamic_count(&self) -> usize {
        self.bindings
            .iter()
            .filter(|s| s.layout.descriptor_type == DescriptorType::DynamicUniformBuffer)
            .map(|s| s.elements.len())
            .sum()
    }
}

impl fmt::Debug for SoftDescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|s| {
                (
                    s.layout,
                    s.elements
                        .iter()
                        .map(|e| e.as_ref().map(Bound::variant))
                        .collect::<Vec<_>>(),
                )
            }))
            .finish()
    }
}

/// A descriptor set as bound for one dispatch, with resolved dynamic offsets.
#[derive(Clone)]
pub(crate) struct BoundSet {
    pub bindings: Vec<BindingSlots>,
    /// Offsets of dynamic uniform descriptors in binding order.
    pub dynamic_offsets: Vec<u32>,
}

impl BoundSet {
    pub fn capture(set: &SoftDescriptorSet, dynamic_offsets: &[u32]) -> Self {
        Self {
            bindings: set.bindings.clone(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        }
    }
}

/// Resources visible to a kernel during one dispatch.
pub struct Dispatch<'a> {
    pub(crate) sets: &'a [BoundSet],
    pub(crate) group_count: [u32; 3],
}

impl Dispatch<'_> {
    pub fn group_count(&self) -> [u32; 3] {
        self.group_count
    }

    fn element(&self, set: u32, binding: u32, element: u32) -> Result<(&Bound, Option<u32>)> {
        let bound = self
            .sets
            .get(set as usize)
            .ok_or_else(|| Error::InvalidState(format!("no descriptor set bound at {set}")))?;
        let mut dynamic_index = 0usize;
        for slots in &bound.bindings {
            let dynamic =
                slots.layout.descriptor_type == DescriptorType::DynamicUniformBuffer;
            if slots.layout.binding == binding {
                let resource = slots
                    .elements
                    .get(element as usize)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| {
                        Error::InvalidState(format!(
                            "set {set} binding {binding} element {element} is not written"
                        ))
                    })?;
                let offset = dynamic
                    .then(|| bound.dynamic_offsets.get(dynamic_index + element as usize).copied())
                    .flatten();
                return Ok((resource, offset));
            }
            if dynamic {
                dynamic_index += slots.elements.len();
            }
        }
        Err(Error::InvalidState(format!(
            "set {set} has no binding {binding}"
        )))
    }

    /// Read a uniform value at its dynamic offset.
    pub fn read_uniform<T: Pod>(&self, set: u32, binding: u32) -> Result<T> {
        let (Bound::Uniform { buffer, range }, offset) = self.element(set, binding, 0)? else {
            return Err(Error::InvalidState(format!(
                "set {set} binding {binding} is not a uniform buffer"
            )));
        };
        let size = std::mem::size_of::<T>();
        if size as u64 > *range {
            return Err(Error::InvalidState(format!(
                "uniform of {size} bytes exceeds bound range {range}"
            )));
        }
        let mut bytes = vec![0; size];
        buffer.read(u64::from(offset.unwrap_or(0)), &mut bytes)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn storage_buffer(&self, set: u32, binding: u32, writable: bool) -> Result<&Arc<BufferInner>> {
        match self.element(set, binding, 0)?.0 {
            Bound::Storage(buffer) => Ok(buffer),
            Bound::ReadOnlyStorage(buffer) if !writable => Ok(buffer),
            other => Err(Error::InvalidState(format!(
                "set {set} binding {binding} holds a {}, not a {}storage buffer",
                other.variant(),
                if writable { "writable " } else { "" }
            ))),
        }
    }

    pub fn storage_size(&self, set: u32, binding: u32) -> Result<u64> {
        Ok(self.storage_buffer(set, binding, false)?.size)
    }

    pub fn read_storage(&self, set: u32, binding: u32, offset: u64, out: &mut [u8]) -> Result<()> {
        self.storage_buffer(set, binding, false)?.read(offset, out)
    }

    pub fn write_storage(&self, set: u32, binding: u32, offset: u64, data: &[u8]) -> Result<()> {
        self.storage_buffer(set, binding, true)?.write(offset, data)
    }

    /// Texel blocks of one mip level of a bound sampled image.
    pub fn sampled_image_mip(
        &self,
        set: u32,
        binding: u32,
        element: u32,
        mip: u32,
    ) -> Result<Vec<u8>> {
        let Bound::SampledImage(image) = self.element(set, binding, element)?.0 else {
            return Err(Error::InvalidState(format!(
                "set {set} binding {binding} is not a sampled image"
            )));
        };
        image
            .mips
            .get(mip as usize)
            .map(|data| data.read().clone())
            .ok_or_else(|| Error::InvalidState(format!("image has no mip level {mip}")))
    }

    fn storage_image(&self, set: u32, binding: u32) -> Result<&Arc<TargetImageInner>> {
        match self.element(set, binding, 0)?.0 {
            Bound::StorageImage(image) => Ok(image),
            other => Err(Error::InvalidState(format!(
                "set {set} binding {binding} holds a {}, not a storage image",
                other.variant()
            ))),
        }
    }

    /// Width and height of a bound storage image.
    pub fn storage_image_extent(&self, set: u32, binding: u32) -> Result<(u32, u32)> {
        let image = self.storage_image(set, binding)?;
        Ok((image.width, image.height))
    }

    /// Read row-major texels of a bound storage image starting at byte `offset`.
    pub fn read_storage_image(&self, set: u32, binding: u32, offset: u64, out: &mut [u8]) -> Result<()> {
        let image = self.storage_image(set, binding)?;
        let texels = image.texels.read();
        let range = byte_range(offset, out.len() as u64, texels.len() as u64)?;
        out.copy_from_slice(&texels[range]);
        Ok(())
    }

    pub fn write_storage_image(&self, set: u32, binding: u32, offset: u64, data: &[u8]) -> Result<()> {
        let image = self.storage_image(set, binding)?;
        let mut texels = image.texels.write();
        let range = byte_range(offset, data.len() as u64, texels.len() as u64)?;
        texels[range].copy_from_slice(data);
        Ok(())
    }

    /// Texels of a bound attachment or storage image created with sampling allowed.
    pub fn sampled_target_texels(&self, set: u32, binding: u32, element: u32) -> Result<Vec<u8>> {
        let Bound::SampledTarget(image) = self.element(set, binding, element)?.0 else {
            return Err(Error::InvalidState(format!(
                "set {set} binding {binding} is not a sampled target image"
            )));
        };
        Ok(image.texels.read().clone())
    }

    pub fn sampler(&self, set: u32, binding: u32, element: u32) -> Result<SamplerFilter> {
        match self.element(set, binding, element)?.0 {
            Bound::Sampler(filter) => Ok(*filter),
            other => Err(Error::InvalidState(format!(
                "set {set} binding {binding} holds a {}, not a sampler",
                other.variant()
            ))),
        }
    }

    /// Trace a ray against a bound TLAS and return the closest hit.
    pub fn trace_ray(&self, set: u32, binding: u32, ray: &Ray) -> Result<Option<Hit>> {
        let Bound::Tlas(tlas) = self.element(set, binding, 0)?.0 else {
            return Err(Error::InvalidState(format!(
                "set {set} binding {binding} is not a TLAS"
            )));
        };
        match &*tlas.contents.read() {
            Contents::Top(top) => Ok(top.trace(ray)),
            _ => Err(Error::InvalidState("traced a TLAS that has not been built".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SoftBuffer;
    use tessera_core::BufferKind;

    fn layout() -> SoftDescriptorSetLayout {
        SoftDescriptorSetLayout {
            bindings: vec![
                DescriptorBinding::single(2, DescriptorType::StorageBuffer),
                DescriptorBinding {
                    binding: 0,
                    descriptor_type: DescriptorType::DynamicUniformBuffer,
                    count: 2,
                },
                DescriptorBinding::single(1, DescriptorType::DynamicUniformBuffer),
            ],
        }
    }

    #[test]
    fn dynamic_offsets_follow_binding_order() {
        let uniforms = SoftBuffer::new(BufferKind::UniformUpload, 1024);
        uniforms.0.write(256, &7u32.to_le_bytes()).unwrap();
        uniforms.0.write(512, &9u32.to_le_bytes()).unwrap();
        let mut set = SoftDescriptorSet::new(&layout());
        assert_eq!(set.dynamic_count(), 3);
        let uniform = |_| Bound::Uniform {
            buffer: Arc::clone(&uniforms.0),
            range: 4,
        };
        set.write(0, 0, DescriptorType::DynamicUniformBuffer, (0..2).map(uniform).collect());
        set.write(1, 0, DescriptorType::DynamicUniformBuffer, vec![uniform(0)]);

        let bound = [BoundSet::capture(&set, &[0, 256, 512])];
        let dispatch = Dispatch {
            sets: &bound,
            group_count: [1, 1, 1],
        };
        assert_eq!(dispatch.read_uniform::<u32>(0, 1).unwrap(), 9);
        assert_eq!(dispatch.read_uniform::<u32>(0, 0).unwrap(), 0);
        assert!(dispatch.read_uniform::<u64>(0, 1).is_err());
    }

    #[test]
    fn read_only_storage_rejects_writes() {
        let buffer = SoftBuffer::new(BufferKind::StorageAsset, 16);
        let layout = SoftDescriptorSetLayout {
            bindings: vec![DescriptorBinding::single(
                0,
                DescriptorType::ReadOnlyStorageBuffer,
            )],
        };
        let mut set = SoftDescriptorSet::new(&layout);
        set.write(
            0,
            0,
            DescriptorType::ReadOnlyStorageBuffer,
            vec![Bound::ReadOnlyStorage(Arc::clone(&buffer.0))],
        );
        let bound = [BoundSet::capture(&set, &[])];
        let dispatch = Dispatch {
            sets: &bound,
            group_count: [1, 1, 1],
        };
        assert_eq!(dispatch.storage_size(0, 0).unwrap(), 16);
        assert!(dispatch.write_storage(0, 0, 0, &[1]).is_err());
        let mut out = [0; 4];
        assert!(dispatch.read_storage(0, 0, 0, &mut out).is_ok());
    }

    #[test]
    fn unwritten_descriptors_are_reported() {
        let set = SoftDescriptorSet::new(&layout());
        let bound = [BoundSet::capture(&set, &[0, 0, 0])];
        let dispatch = Dispatch {
            sets: &bound,
            group_count: [1, 1, 1],
        };
        assert!(dispatch.read_storage(0, 2, 0, &mut [0; 4]).is_err());
        assert!(dispatch.read_storage(1, 2, 0, &mut [0; 4]).is_err());
    }

    #[test]
    fn storage_images_are_writable_and_samplers_are_not() {
        use crate::resource::SoftTargetImage;
        use tessera_core::{StorageImageFormat, TargetImageKind};

        let image = SoftTargetImage::new(TargetImageKind::Storage(StorageImageFormat::R32Uint), 2, 2, true);
        let layout = SoftDescriptorSetLayout {
            bindings: vec![
                DescriptorBinding::single(0, DescriptorType::StorageImage),
                DescriptorBinding::single(1, DescriptorType::Sampler),
            ],
        };
        let mut set = SoftDescriptorSet::new(&layout);
        set.write(0, 0, DescriptorType::StorageImage, vec![Bound::StorageImage(Arc::clone(&image.0))]);
        set.write(1, 0, DescriptorType::Sampler, vec![Bound::Sampler(SamplerFilter::Nearest)]);
        let bound = [BoundSet::capture(&set, &[])];
        let dispatch = Dispatch {
            sets: &bound,
            group_count: [1, 1, 1],
        };
        assert_eq!(dispatch.storage_image_extent(0, 0).unwrap(), (2, 2));
        dispatch.write_storage_image(0, 0, 12, &5u32.to_le_bytes()).unwrap();
        assert!(dispatch.write_storage_image(0, 0, 14, &[0; 4]).is_err());
        assert_eq!(&image.texels()[12..], &5u32.to_le_bytes());
        assert_eq!(dispatch.sampler(0, 1, 0).unwrap(), SamplerFilter::Nearest);
        assert!(dispatch.write_storage_image(0, 1, 0, &[0]).is_err());
    }
}
