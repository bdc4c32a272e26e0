//! Turning a resolver's answer bag into a wire-format DNS reply: section
//! assignment with CNAME/DNAME chasing, DNSSEC inclusion policy, duplicate
//! suppression, truncation, and the bypass pass-through patches.

use tracing::debug;

use crate::answer::{AnswerFlags, AnswerItem, DnsAnswer};
use crate::enums::DNS_RCODE_SERVFAIL;
use crate::error::StubNsError;
use crate::packet::{DnsPacket, PacketBuilder, PacketSection};
use crate::resolver::QueryCompletion;
use crate::resourcerecord::RrKey;
use crate::utils::nsid_string;
use crate::{ADVERTISE_DATAGRAM_SIZE_MAX, CNAME_REDIRECT_MAX, Question};

/// The three reply sections a query accumulates across completions. They stay
/// pairwise disjoint by RR key once [suppress_duplicate_section_rrs] has run.
#[derive(Debug, Default)]
pub struct ReplySections {
    pub answer: DnsAnswer,
    pub authoritative: DnsAnswer,
    pub additional: DnsAnswer,
}

/// Reply with the DNSSEC DO bit set? Only if the client supports it; and we
/// did any DNSSEC validation ourselves, or consider the data fully
/// authenticated because we generated it locally, or the client set CD.
pub fn reply_with_edns0_do(request: &DnsPacket, completion: &QueryCompletion) -> bool {
    request.edns_do()
        && (completion.answer_dnssec_result.is_some()
            || completion.is_fully_authenticated()
            || request.header().cd)
}

fn add_with_rrsig(reply: &mut DnsAnswer, item: &AnswerItem, flags: AnswerFlags, with_rrsig: bool) {
    reply.add(AnswerItem {
        rr: item.rr.clone(),
        ifindex: item.ifindex,
        flags,
        rrsig: item.rrsig.clone(),
    });
    if with_rrsig {
        if let Some(rrsig) = &item.rrsig {
            reply.add(AnswerItem {
                rr: rrsig.clone(),
                ifindex: item.ifindex,
                flags,
                rrsig: None,
            });
        }
    }
}

/// Copy all RRs from `answer` into `reply` if they match `question`. There
/// might be direct and indirect matches (i.e. via CNAME/DNAME). On an
/// indirect one, remember where it points and restart the loop against the
/// redirected key, bounded by [CNAME_REDIRECT_MAX].
fn collect_answer_by_question(
    reply: &mut DnsAnswer,
    answer: &DnsAnswer,
    question: &Question,
    with_rrsig: bool,
) -> Result<(), StubNsError> {
    let mut redirected_key: Option<RrKey> = None;
    let mut n_cname_redirects = 0usize;

    loop {
        let mut next_redirected_key: Option<RrKey> = None;

        for item in answer.iter() {
            let key = match &redirected_key {
                Some(key) => key.clone(),
                None => question.key(),
            };

            if !key.matches_rr(&item.rr) {
                // Not a direct match, but maybe the RR is a CNAME or DNAME
                // that redirects the key somewhere else
                let Some(target) = item.rr.cname_target(&key) else {
                    continue;
                };

                n_cname_redirects += 1;
                if n_cname_redirects > CNAME_REDIRECT_MAX {
                    return Err(StubNsError::CnameLoop);
                }

                // There can only be one CNAME per name, hence no point in
                // storing more than one here
                next_redirected_key = Some(RrKey::new(key.class, key.rrtype, target));
            }

            // Mask the section info; the primary answers always go without
            // section info so that they land in the answer section when we
            // synthesize the reply
            add_with_rrsig(reply, item, item.flags.without_sections(), with_rrsig);
        }

        match next_redirected_key {
            Some(key) => redirected_key = Some(key),
            None => break,
        }
    }

    Ok(())
}

/// Copy all RRs from `answer` into `reply` if they originate from the given
/// section, skipping any RR already listed in one of the exclusion sets
fn collect_answer_by_section(
    reply: &mut DnsAnswer,
    answer: &DnsAnswer,
    section: AnswerFlags,
    exclude1: &DnsAnswer,
    exclude2: &DnsAnswer,
    with_dnssec: bool,
) {
    for item in answer.iter() {
        if exclude1.contains(&item.rr) || exclude2.contains(&item.rr) {
            continue;
        }
        if !with_dnssec && item.rr.rrtype.is_dnssec() {
            continue;
        }
        if item.flags.section() != section.section() {
            continue;
        }
        add_with_rrsig(reply, item, item.flags, with_dnssec);
    }
}

/// Assign the completion's RRs to their reply sections, reproducing the
/// section placement the upstream server used where it's known. Anything
/// directly answering the question goes to ANSWER regardless of its origin;
/// AUTHORITY keeps upstream authority RRs not already in ANSWER; everything
/// else (additional-origin, unclaimed answer-origin, unmarked) lands in
/// ADDITIONAL.
pub fn assign_sections(
    sections: &mut ReplySections,
    answer: &DnsAnswer,
    question: &Question,
    edns0_do: bool,
) -> Result<(), StubNsError> {
    collect_answer_by_question(&mut sections.answer, answer, question, edns0_do)?;

    collect_answer_by_section(
        &mut sections.authoritative,
        answer,
        AnswerFlags::SECTION_AUTHORITY,
        &sections.answer,
        &DnsAnswer::new(),
        edns0_do,
    );

    collect_answer_by_section(
        &mut sections.additional,
        answer,
        AnswerFlags::SECTION_ADDITIONAL,
        &sections.answer,
        &sections.authoritative,
        edns0_do,
    );
    collect_answer_by_section(
        &mut sections.additional,
        answer,
        AnswerFlags::SECTION_ANSWER,
        &sections.answer,
        &sections.authoritative,
        edns0_do,
    );
    collect_answer_by_section(
        &mut sections.additional,
        answer,
        AnswerFlags::NONE,
        &sections.answer,
        &sections.authoritative,
        edns0_do,
    );

    Ok(())
}

/// Following a CNAME/DNAME chain builds the sections up from several reply
/// packets, so an RR can end up in more than one of them. Remove everything
/// in a higher-priority section from the lower-priority ones, matching by RR
/// key so RRsets stay whole.
pub fn suppress_duplicate_section_rrs(sections: &mut ReplySections) {
    let ReplySections {
        answer,
        authoritative,
        additional,
    } = sections;
    authoritative.remove_by_answer_keys(answer);
    additional.remove_by_answer_keys(answer);
    additional.remove_by_answer_keys(authoritative);
}

/// Start a reply under the client's size ceiling with the question appended.
/// A question that doesn't even fit marks the reply truncated right away.
fn make_reply_packet(
    size_max: usize,
    question: Option<&Question>,
) -> Result<(PacketBuilder, bool), StubNsError> {
    let mut builder = PacketBuilder::new(size_max);
    let mut truncated = false;
    if let Some(question) = question {
        match builder.append_question(question) {
            Ok(()) => {}
            Err(StubNsError::MessageTooLarge) => truncated = true,
            Err(error) => return Err(error),
        }
    }
    Ok((builder, truncated))
}

/// Add the three sections to the packet. If the answer section doesn't fit
/// that's truncation. If the authoritative section doesn't fit it only counts
/// as truncation in DNSSEC mode; in all other cases the dropped RRs are not
/// essential, so no TC.
fn add_reply_packet_body(
    builder: &mut PacketBuilder,
    sections: &ReplySections,
    edns0_do: bool,
) -> Result<bool, StubNsError> {
    let mut tc = false;
    if !builder.append_section(&sections.answer, PacketSection::Answer)? {
        tc = true;
    } else if !builder.append_section(&sections.authoritative, PacketSection::Authority)? {
        if edns0_do {
            tc = true;
        }
    } else {
        builder.append_section(&sections.additional, PacketSection::Additional)?;
    }
    Ok(tc)
}

#[allow(clippy::too_many_arguments)]
fn finish_reply_packet(
    builder: PacketBuilder,
    id: u16,
    mut rcode: u16,
    mut tc: bool,       // set the Truncated bit?
    aa: bool,           // set the Authoritative Answer bit?
    add_opt: bool,      // add an OPT RR to this packet?
    mut edns0_do: bool, // set the EDNS0 DNSSEC OK bit?
    ad: bool,           // set the DNSSEC authenticated data bit?
    mut cd: bool,       // set the DNSSEC checking disabled bit?
    max_udp_size: u16,  // the maximum UDP datagram size to advertise to clients
    nsid: bool,         // whether to add NSID
) -> Result<Vec<u8>, StubNsError> {
    let mut builder = builder;
    if add_opt {
        let nsid_value = if nsid { nsid_string() } else { None };
        match builder.append_opt(max_udp_size, edns0_do, nsid_value, rcode) {
            Ok(()) => {}
            // Hit the size limit? then indicate truncation
            Err(StubNsError::MessageTooLarge) => tc = true,
            Err(error) => return Err(error),
        }
    } else {
        // If the client can't do EDNS0, don't do DO either
        edns0_do = false;

        // If we don't do EDNS, clamp the rcode to 4 bit
        if rcode > 0xF {
            rcode = DNS_RCODE_SERVFAIL;
        }
    }

    // Don't set the CD bit unless DO is on, too
    if !edns0_do {
        cd = false;
    }

    // Note that the AD bit may be set even if the client didn't signal DO, as
    // per RFC 6840, section 5.7
    builder.finish(id, rcode, tc, aa, ad, cd)
}

/// Build the full reply for a completed query from its accumulated sections
pub fn build_reply(
    request: &DnsPacket,
    sections: &mut ReplySections,
    completion: &QueryCompletion,
    rcode: u16,
    advertise_size: u16,
    nsid_allowed: bool,
) -> Result<Vec<u8>, StubNsError> {
    let edns0_do = reply_with_edns0_do(request, completion);

    let (mut builder, mut truncated) =
        make_reply_packet(request.payload_size_max(), request.question())?;

    suppress_duplicate_section_rrs(sections);

    if add_reply_packet_body(&mut builder, sections, edns0_do)? {
        truncated = true;
    }

    finish_reply_packet(
        builder,
        request.id(),
        rcode,
        truncated,
        completion.is_fully_synthetic(),
        request.opt().is_some(),
        edns0_do,
        request.header().ad && completion.is_fully_authenticated(),
        request.header().cd,
        advertise_size,
        request.nsid_requested() && nsid_allowed,
    )
}

/// Build an empty-bodied reply carrying just a response code, used for every
/// admission rejection
pub fn build_failure(
    request: &DnsPacket,
    rcode: u16,
    authenticated: bool,
    advertise_size: u16,
    nsid_allowed: bool,
) -> Result<Vec<u8>, StubNsError> {
    let (builder, truncated) =
        make_reply_packet(request.payload_size_max(), request.question())?;

    finish_reply_packet(
        builder,
        request.id(),
        rcode,
        truncated,
        false,
        request.opt().is_some(),
        request.edns_do(),
        request.header().ad && authenticated,
        request.header().cd,
        advertise_size,
        request.nsid_requested() && nsid_allowed,
    )
}

/// Propagate an upstream packet as our own reply, with four patches: the
/// client's transaction id, our advertised datagram size, TTLs aged by the
/// time the packet sat with us, and truncation down to what the client can
/// take.
pub fn patch_bypass_reply(
    original: &DnsPacket,
    request: &DnsPacket,
) -> Result<Vec<u8>, StubNsError> {
    let mut copy = original.duplicate()?;

    // Make the upstream reply look like it was ours all along
    copy.patch_id(request.id());

    // Patch in our own maximum datagram size, if EDNS0 was on
    copy.patch_max_udp_size(ADVERTISE_DATAGRAM_SIZE_MAX);

    // Lower all TTLs by the time passed since we received the datagram
    copy.patch_ttls(original.timestamp.elapsed());

    // Our upstream connection might have supported larger DNS requests than
    // our downstream one, hence truncate and flag if the client can't take it
    if copy.len() > request.payload_size_max() {
        debug!(
            "Artificially truncating stub response, as advertised size of client is smaller than upstream one."
        );
        copy.truncate_to(request.payload_size_max());
    }

    Ok(copy.into_bytes())
}
