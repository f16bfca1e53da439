use std::mem::MaybeUninit;

use libc::{
    mach_msg_type_number_t, mach_task_basic_info_data_t, mach_task_self, task_info, task_info_t, KERN_SUCCESS,
    MACH_TASK_BASIC_INFO, MACH_TASK_BASIC_INFO_COUNT,
};

use crate::MemorySizes;

/// Queries the Mach task information for the virtual and resident memory sizes of this process.
pub fn memory_sizes() -> Option<MemorySizes> {
    let mut basic_task_info = MaybeUninit::<mach_task_basic_info_data_t>::uninit();
    let mut basic_task_info_len = MACH_TASK_BASIC_INFO_COUNT;

    // SAFETY: We're passing a valid pointer, and struct length, for the task info output.
    let result = unsafe {
        task_info(
            mach_task_self(),
            MACH_TASK_BASIC_INFO,
            basic_task_info.as_mut_ptr() as task_info_t,
            &mut basic_task_info_len as *mut mach_msg_type_number_t,
        )
    };

    if result != KERN_SUCCESS {
        return None;
    }

    // SAFETY: We know the structure has been populated by `task_info` at this point.
    let basic_task_info = unsafe { basic_task_info.assume_init() };
    Some(MemorySizes {
        virtual_size: basic_task_info.virtual_size,
        resident_size: basic_task_info.resident_size,
    })
}
