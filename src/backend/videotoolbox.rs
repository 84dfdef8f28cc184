// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VideoToolbox decoder backend.
//!
//! Format descriptions and sample buffers are converted to their CoreMedia counterparts and
//! submitted to a `VTDecompressionSession`. Decoded frames are reported through the session's
//! [`OutputCallback`] as retained [`ImageBuffer`]s, on a thread owned by VideoToolbox.

#![allow(non_upper_case_globals, non_snake_case)]

use std::ffi::c_int;
use std::ffi::c_void;
use std::ptr;

use core_foundation::base::CFType;
use core_foundation::base::TCFType;
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_foundation_sys::array::CFArrayGetCount;
use core_foundation_sys::array::CFArrayGetValueAtIndex;
use core_foundation_sys::array::CFArrayRef;
use core_foundation_sys::base::kCFAllocatorDefault;
use core_foundation_sys::base::Boolean;
use core_foundation_sys::base::CFAllocatorRef;
use core_foundation_sys::base::CFRelease;
use core_foundation_sys::base::CFTypeRef;
use core_foundation_sys::base::OSStatus;
use core_foundation_sys::dictionary::CFDictionaryRef;
use core_foundation_sys::dictionary::CFDictionarySetValue;
use core_foundation_sys::dictionary::CFMutableDictionaryRef;
use core_foundation_sys::number::kCFBooleanTrue;
use core_foundation_sys::string::CFStringRef;
use log::debug;

use crate::decoder::BackendSession;
use crate::decoder::DecodeFrameFlags;
use crate::decoder::DecodeInfoFlags;
use crate::decoder::DecoderBackend;
use crate::decoder::DecoderSpecification;
use crate::decoder::FrameOutput;
use crate::decoder::ImageBufferAttributes;
use crate::decoder::OutputCallback;
use crate::media::FormatDescription;
use crate::media::MediaTime;
use crate::media::SampleBuffer;
use crate::Error;
use crate::Result;

pub type CMFormatDescriptionRef = *const c_void;
pub type CMBlockBufferRef = *const c_void;
pub type CMSampleBufferRef = *const c_void;
pub type CVImageBufferRef = *const c_void;
pub type VTDecompressionSessionRef = *const c_void;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CMTime {
    pub value: i64,
    pub timescale: i32,
    pub flags: u32,
    pub epoch: i64,
}

impl From<MediaTime> for CMTime {
    fn from(time: MediaTime) -> Self {
        Self {
            value: time.value,
            timescale: time.timescale,
            flags: time.flags,
            epoch: 0,
        }
    }
}

impl From<CMTime> for MediaTime {
    fn from(time: CMTime) -> Self {
        Self {
            value: time.value,
            timescale: time.timescale,
            flags: time.flags,
        }
    }
}

#[repr(C)]
struct CMSampleTimingInfo {
    duration: CMTime,
    presentation_time_stamp: CMTime,
    decode_time_stamp: CMTime,
}

type VTDecompressionOutputCallback = extern "C" fn(
    decompression_output_ref_con: *mut c_void,
    source_frame_ref_con: *mut c_void,
    status: OSStatus,
    info_flags: u32,
    image_buffer: CVImageBufferRef,
    presentation_time_stamp: CMTime,
    presentation_duration: CMTime,
);

#[repr(C)]
struct VTDecompressionOutputCallbackRecord {
    decompression_output_callback: VTDecompressionOutputCallback,
    decompression_output_ref_con: *mut c_void,
}

const kCMBlockBufferAssureMemoryNowFlag: u32 = 1 << 0;

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    static kCMSampleAttachmentKey_DisplayImmediately: CFStringRef;

    fn CMVideoFormatDescriptionCreateFromH264ParameterSets(
        allocator: CFAllocatorRef,
        parameter_set_count: usize,
        parameter_set_pointers: *const *const u8,
        parameter_set_sizes: *const usize,
        nal_unit_header_length: c_int,
        format_description_out: *mut CMFormatDescriptionRef,
    ) -> OSStatus;

    fn CMBlockBufferCreateWithMemoryBlock(
        structure_allocator: CFAllocatorRef,
        memory_block: *mut c_void,
        block_length: usize,
        block_allocator: CFAllocatorRef,
        custom_block_source: *const c_void,
        offset_to_data: usize,
        data_length: usize,
        flags: u32,
        block_buffer_out: *mut CMBlockBufferRef,
    ) -> OSStatus;

    fn CMBlockBufferReplaceDataBytes(
        source_bytes: *const c_void,
        destination_buffer: CMBlockBufferRef,
        offset_into_destination: usize,
        data_length: usize,
    ) -> OSStatus;

    fn CMSampleBufferCreate(
        allocator: CFAllocatorRef,
        data_buffer: CMBlockBufferRef,
        data_ready: Boolean,
        make_data_ready_callback: *const c_void,
        make_data_ready_refcon: *mut c_void,
        format_description: CMFormatDescriptionRef,
        num_samples: isize,
        num_sample_timing_entries: isize,
        sample_timing_array: *const CMSampleTimingInfo,
        num_sample_size_entries: isize,
        sample_size_array: *const usize,
        sample_buffer_out: *mut CMSampleBufferRef,
    ) -> OSStatus;

    fn CMSampleBufferGetSampleAttachmentsArray(
        sbuf: CMSampleBufferRef,
        create_if_necessary: Boolean,
    ) -> CFArrayRef;
}

#[link(name = "VideoToolbox", kind = "framework")]
extern "C" {
    static kVTVideoDecoderSpecification_EnableHardwareAcceleratedVideoDecoder: CFStringRef;
    static kVTVideoDecoderSpecification_RequireHardwareAcceleratedVideoDecoder: CFStringRef;

    fn VTDecompressionSessionCreate(
        allocator: CFAllocatorRef,
        video_format_description: CMFormatDescriptionRef,
        video_decoder_specification: CFDictionaryRef,
        destination_image_buffer_attributes: CFDictionaryRef,
        output_callback: *const VTDecompressionOutputCallbackRecord,
        decompression_session_out: *mut VTDecompressionSessionRef,
    ) -> OSStatus;

    fn VTDecompressionSessionDecodeFrame(
        session: VTDecompressionSessionRef,
        sample_buffer: CMSampleBufferRef,
        decode_flags: u32,
        source_frame_ref_con: *mut c_void,
        info_flags_out: *mut u32,
    ) -> OSStatus;

    fn VTDecompressionSessionCanAcceptFormatDescription(
        session: VTDecompressionSessionRef,
        new_format_desc: CMFormatDescriptionRef,
    ) -> Boolean;

    fn VTDecompressionSessionWaitForAsynchronousFrames(
        session: VTDecompressionSessionRef,
    ) -> OSStatus;

    fn VTDecompressionSessionInvalidate(session: VTDecompressionSessionRef);
}

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    static kCVPixelBufferPixelFormatTypeKey: CFStringRef;
    static kCVPixelBufferWidthKey: CFStringRef;
    static kCVPixelBufferHeightKey: CFStringRef;
    static kCVPixelBufferMetalCompatibilityKey: CFStringRef;
    #[cfg(target_os = "macos")]
    static kCVPixelBufferOpenGLCompatibilityKey: CFStringRef;
    #[cfg(target_os = "ios")]
    static kCVPixelBufferOpenGLESCompatibilityKey: CFStringRef;

    fn CVBufferRetain(buffer: CVImageBufferRef) -> CVImageBufferRef;
    fn CVBufferRelease(buffer: CVImageBufferRef);
    fn CVPixelBufferGetWidth(pixel_buffer: CVImageBufferRef) -> usize;
    fn CVPixelBufferGetHeight(pixel_buffer: CVImageBufferRef) -> usize;
}

/// Requests that `sample_buffer` be displayed as soon as it is decoded.
///
/// A null `sample_buffer` is ignored.
///
/// # Safety
///
/// `sample_buffer` must be null or a valid `CMSampleBufferRef`.
pub unsafe fn set_display_immediately(sample_buffer: CMSampleBufferRef) {
    if sample_buffer.is_null() {
        return;
    }

    let attachments = CMSampleBufferGetSampleAttachmentsArray(sample_buffer, 1);
    if attachments.is_null() || CFArrayGetCount(attachments) == 0 {
        return;
    }

    let attachment = CFArrayGetValueAtIndex(attachments, 0) as CFMutableDictionaryRef;
    CFDictionarySetValue(
        attachment,
        kCMSampleAttachmentKey_DisplayImmediately as *const c_void,
        kCFBooleanTrue as *const c_void,
    );
}

/// An owned reference to a CoreFoundation object, released on drop.
struct Owned(CFTypeRef);

impl Owned {
    fn as_ptr(&self) -> *const c_void {
        self.0
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: we hold the only reference we were given.
            unsafe { CFRelease(self.0) };
        }
    }
}

fn create_format_description(format: &FormatDescription) -> Result<Owned> {
    let sets = [format.sps().as_ref(), format.pps().as_ref()];
    let pointers = sets.map(|set| set.as_ptr());
    let sizes = sets.map(|set| set.len());
    let mut description: CMFormatDescriptionRef = ptr::null();

    // SAFETY: the parameter sets outlive the call, which copies them.
    let status = unsafe {
        CMVideoFormatDescriptionCreateFromH264ParameterSets(
            kCFAllocatorDefault,
            sets.len(),
            pointers.as_ptr(),
            sizes.as_ptr(),
            format.nal_unit_header_length() as c_int,
            &mut description,
        )
    };
    Error::check_status(status, "CMVideoFormatDescriptionCreateFromH264ParameterSets")?;

    Ok(Owned(description))
}

fn create_sample_buffer(sample: &SampleBuffer, description: &Owned) -> Result<Owned> {
    let data = sample.data();
    let mut block: CMBlockBufferRef = ptr::null();

    // SAFETY: CoreMedia allocates the block, which we fill with a copy of the sample data.
    let status = unsafe {
        CMBlockBufferCreateWithMemoryBlock(
            kCFAllocatorDefault,
            ptr::null_mut(),
            data.len(),
            kCFAllocatorDefault,
            ptr::null(),
            0,
            data.len(),
            kCMBlockBufferAssureMemoryNowFlag,
            &mut block,
        )
    };
    Error::check_status(status, "CMBlockBufferCreateWithMemoryBlock")?;
    let block = Owned(block);

    // SAFETY: the block was created with room for `data.len()` bytes.
    let status = unsafe {
        CMBlockBufferReplaceDataBytes(data.as_ptr() as *const c_void, block.as_ptr(), 0, data.len())
    };
    Error::check_status(status, "CMBlockBufferReplaceDataBytes")?;

    let timing = CMSampleTimingInfo {
        duration: sample.timing().duration.into(),
        presentation_time_stamp: sample.timing().presentation.into(),
        decode_time_stamp: sample.timing().decode.into(),
    };
    let size = data.len();
    let mut sample_buffer: CMSampleBufferRef = ptr::null();

    // SAFETY: every pointer is valid for the duration of the call.
    let status = unsafe {
        CMSampleBufferCreate(
            kCFAllocatorDefault,
            block.as_ptr(),
            1,
            ptr::null(),
            ptr::null_mut(),
            description.as_ptr(),
            1,
            1,
            &timing,
            1,
            &size,
            &mut sample_buffer,
        )
    };
    Error::check_status(status, "CMSampleBufferCreate")?;

    if sample.display_immediately() {
        // SAFETY: `sample_buffer` was just created.
        unsafe { set_display_immediately(sample_buffer) };
    }

    Ok(Owned(sample_buffer))
}

fn key(key: CFStringRef) -> CFType {
    // SAFETY: framework constants are valid for the lifetime of the process.
    unsafe { CFString::wrap_under_get_rule(key) }.as_CFType()
}

fn decoder_specification_dictionary(spec: &DecoderSpecification) -> CFDictionary<CFType, CFType> {
    let mut pairs = Vec::new();

    // SAFETY: reading framework constants.
    unsafe {
        if let Some(enable) = spec.enable_hardware_accelerated_video_decoder {
            pairs.push((
                key(kVTVideoDecoderSpecification_EnableHardwareAcceleratedVideoDecoder),
                CFBoolean::from(enable).as_CFType(),
            ));
        }
        if let Some(require) = spec.require_hardware_accelerated_video_decoder {
            pairs.push((
                key(kVTVideoDecoderSpecification_RequireHardwareAcceleratedVideoDecoder),
                CFBoolean::from(require).as_CFType(),
            ));
        }
    }

    CFDictionary::from_CFType_pairs(&pairs)
}

fn image_attributes_dictionary(attributes: &ImageBufferAttributes) -> CFDictionary<CFType, CFType> {
    let mut pairs = Vec::new();

    // SAFETY: reading framework constants.
    unsafe {
        if let Some(format) = attributes.pixel_format_type {
            pairs.push((
                key(kCVPixelBufferPixelFormatTypeKey),
                CFNumber::from(format as i32).as_CFType(),
            ));
        }
        if let Some(width) = attributes.width {
            pairs.push((key(kCVPixelBufferWidthKey), CFNumber::from(width as i32).as_CFType()));
        }
        if let Some(height) = attributes.height {
            pairs.push((key(kCVPixelBufferHeightKey), CFNumber::from(height as i32).as_CFType()));
        }
        if attributes.metal_compatibility {
            pairs.push((
                key(kCVPixelBufferMetalCompatibilityKey),
                CFBoolean::true_value().as_CFType(),
            ));
        }
        #[cfg(target_os = "macos")]
        if attributes.opengl_compatibility {
            pairs.push((
                key(kCVPixelBufferOpenGLCompatibilityKey),
                CFBoolean::true_value().as_CFType(),
            ));
        }
        #[cfg(target_os = "ios")]
        if attributes.opengles_compatibility {
            pairs.push((
                key(kCVPixelBufferOpenGLESCompatibilityKey),
                CFBoolean::true_value().as_CFType(),
            ));
        }
    }

    CFDictionary::from_CFType_pairs(&pairs)
}

/// A decoded picture, retained for as long as this handle lives.
pub struct ImageBuffer(CVImageBufferRef);

// SAFETY: CoreVideo buffers are reference counted atomically.
unsafe impl Send for ImageBuffer {}

impl ImageBuffer {
    /// # Safety
    ///
    /// `buffer` must be a valid, non-null `CVImageBufferRef`.
    unsafe fn retain(buffer: CVImageBufferRef) -> Self {
        Self(CVBufferRetain(buffer))
    }

    pub fn as_ptr(&self) -> CVImageBufferRef {
        self.0
    }

    pub fn width(&self) -> usize {
        // SAFETY: the buffer is retained.
        unsafe { CVPixelBufferGetWidth(self.0) }
    }

    pub fn height(&self) -> usize {
        // SAFETY: the buffer is retained.
        unsafe { CVPixelBufferGetHeight(self.0) }
    }
}

impl Drop for ImageBuffer {
    fn drop(&mut self) {
        // SAFETY: we own one reference.
        unsafe { CVBufferRelease(self.0) };
    }
}

extern "C" fn decompression_output(
    decompression_output_ref_con: *mut c_void,
    _source_frame_ref_con: *mut c_void,
    status: OSStatus,
    info_flags: u32,
    image_buffer: CVImageBufferRef,
    presentation_time_stamp: CMTime,
    presentation_duration: CMTime,
) {
    // SAFETY: the ref-con is the callback boxed by `create_decompression_session`, which stays
    // alive until the session is invalidated.
    let callback =
        unsafe { &*(decompression_output_ref_con as *const OutputCallback<ImageBuffer>) };

    let image = if image_buffer.is_null() {
        None
    } else {
        // SAFETY: VideoToolbox hands us a valid buffer for the duration of the call.
        Some(unsafe { ImageBuffer::retain(image_buffer) })
    };

    callback(FrameOutput {
        status,
        info_flags: DecodeInfoFlags(info_flags),
        image,
        presentation_time: presentation_time_stamp.into(),
        presentation_duration: presentation_duration.into(),
    });
}

/// A `VTDecompressionSession` and the state its callback needs.
pub struct VtSession {
    session: VTDecompressionSessionRef,
    callback: *mut OutputCallback<ImageBuffer>,
    format: FormatDescription,
    description: Owned,
}

// SAFETY: VideoToolbox sessions may be used from any thread, one call at a time, which `&mut`
// guarantees.
unsafe impl Send for VtSession {}

/// Creates a decompression session for `format`. `callback` is invoked for every decoded frame
/// until the session is invalidated.
pub fn create_decompression_session(
    format: &FormatDescription,
    decoder_specification: Option<&DecoderSpecification>,
    image_attributes: Option<&ImageBufferAttributes>,
    callback: OutputCallback<ImageBuffer>,
) -> Result<VtSession> {
    let description = create_format_description(format)?;
    let decoder_specification = decoder_specification.map(decoder_specification_dictionary);
    let image_attributes = image_attributes.map(image_attributes_dictionary);

    let callback = Box::into_raw(Box::new(callback));
    let record = VTDecompressionOutputCallbackRecord {
        decompression_output_callback: decompression_output,
        decompression_output_ref_con: callback as *mut c_void,
    };
    let mut session: VTDecompressionSessionRef = ptr::null();

    // SAFETY: every pointer is valid for the duration of the call, and the ref-con outlives the
    // session.
    let status = unsafe {
        VTDecompressionSessionCreate(
            kCFAllocatorDefault,
            description.as_ptr(),
            decoder_specification
                .as_ref()
                .map_or(ptr::null(), |d| d.as_concrete_TypeRef()),
            image_attributes
                .as_ref()
                .map_or(ptr::null(), |d| d.as_concrete_TypeRef()),
            &record,
            &mut session,
        )
    };

    if let Err(e) = Error::check_status(status, "VTDecompressionSessionCreate") {
        // SAFETY: no session was created, so nothing else references the callback.
        drop(unsafe { Box::from_raw(callback) });
        return Err(e);
    }

    debug!("Created decompression session for {}", format.coded_resolution());

    Ok(VtSession {
        session,
        callback,
        format: format.clone(),
        description,
    })
}

impl VtSession {
    pub fn as_ptr(&self) -> VTDecompressionSessionRef {
        self.session
    }
}

impl BackendSession for VtSession {
    fn can_accept_format_description(&self, format: &FormatDescription) -> bool {
        if self.session.is_null() {
            return false;
        }

        match create_format_description(format) {
            // SAFETY: both references are valid.
            Ok(description) => unsafe {
                VTDecompressionSessionCanAcceptFormatDescription(
                    self.session,
                    description.as_ptr(),
                ) != 0
            },
            Err(_) => false,
        }
    }

    fn decode_frame(
        &mut self,
        sample: &SampleBuffer,
        flags: DecodeFrameFlags,
    ) -> Result<DecodeInfoFlags> {
        if self.session.is_null() {
            return Err(Error::ChannelState("decompression session invalidated"));
        }

        if **sample.format_description() != self.format {
            self.description = create_format_description(sample.format_description())?;
            self.format = (**sample.format_description()).clone();
        }

        let sample_buffer = create_sample_buffer(sample, &self.description)?;
        let mut info_flags = 0u32;

        // SAFETY: the session and sample buffer are valid.
        let status = unsafe {
            VTDecompressionSessionDecodeFrame(
                self.session,
                sample_buffer.as_ptr(),
                flags.0,
                ptr::null_mut(),
                &mut info_flags,
            )
        };
        Error::check_status(status, "VTDecompressionSessionDecodeFrame")?;

        Ok(DecodeInfoFlags(info_flags))
    }

    fn wait_for_asynchronous_frames(&mut self) -> Result<()> {
        if self.session.is_null() {
            return Ok(());
        }

        // SAFETY: the session is valid.
        let status = unsafe { VTDecompressionSessionWaitForAsynchronousFrames(self.session) };
        Error::check_status(status, "VTDecompressionSessionWaitForAsynchronousFrames")
    }

    fn invalidate(&mut self) {
        if self.session.is_null() {
            return;
        }

        // SAFETY: invalidation blocks until no callback is running, after which the callback
        // box is ours again.
        unsafe {
            VTDecompressionSessionInvalidate(self.session);
            CFRelease(self.session);
            drop(Box::from_raw(self.callback));
        }
        self.session = ptr::null();
        self.callback = ptr::null_mut();
    }
}

impl Drop for VtSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// Decodes with VideoToolbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoToolboxBackend;

impl DecoderBackend for VideoToolboxBackend {
    type Image = ImageBuffer;
    type Session = VtSession;

    fn create_session(
        &self,
        format: &FormatDescription,
        decoder_specification: Option<&DecoderSpecification>,
        image_attributes: Option<&ImageBufferAttributes>,
        callback: OutputCallback<ImageBuffer>,
    ) -> Result<VtSession> {
        create_decompression_session(format, decoder_specification, image_attributes, callback)
    }
}
